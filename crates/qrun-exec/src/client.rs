//! Cluster access seam
//!
//! Every cluster call the engine makes goes through [`ClusterClient`], so
//! tests can substitute a mock or an in-memory cluster.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use qrun_common::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Change notification for a watched Job
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The Job was created or its status changed
    Applied(Job),
    /// The Job was deleted
    Deleted(Job),
}

/// Stream of Job events as produced by [`ClusterClient::watch_job`]
pub type JobEventStream = BoxStream<'static, Result<JobEvent, Error>>;

/// Trait abstracting the Kubernetes operations the engine needs
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<ConfigMap, Error>;

    /// Delete a ConfigMap with foreground propagation
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error>;

    /// Delete a Secret with foreground propagation
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a Job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error>;

    /// Delete a Job with foreground propagation (its pods go first)
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Read a Job including its status
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error>;

    /// Read the full log of a pod's (single) container
    async fn pod_logs(&self, namespace: &str, pod_name: &str) -> Result<String, Error>;

    /// Subscribe to events for one Job among those matching `label_selector`
    async fn watch_job(
        &self,
        namespace: &str,
        label_selector: &str,
        name: &str,
    ) -> Result<JobEventStream, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), cm).await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::foreground()).await?;
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), secret).await?)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::foreground()).await?;
        Ok(())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), job).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::foreground()).await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_status(name).await?)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(pods.items)
    }

    async fn pod_logs(&self, namespace: &str, pod_name: &str) -> Result<String, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.logs(pod_name, &LogParams::default()).await?)
    }

    async fn watch_job(
        &self,
        namespace: &str,
        label_selector: &str,
        name: &str,
    ) -> Result<JobEventStream, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default()
            .labels(label_selector)
            .fields(&format!("metadata.name={}", name));

        debug!(job = %name, selector = %label_selector, "starting job watch");

        let stream = watcher::watcher(api, config)
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(Event::Apply(job)) | Ok(Event::InitApply(job)) => {
                        Some(Ok(JobEvent::Applied(job)))
                    }
                    Ok(Event::Delete(job)) => Some(Ok(JobEvent::Deleted(job))),
                    Ok(Event::Init) | Ok(Event::InitDone) => None,
                    Err(e) => Some(Err(Error::internal_with_context("watch", e.to_string()))),
                }
            })
            .boxed();

        Ok(stream)
    }
}
