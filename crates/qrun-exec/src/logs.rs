//! Output retrieval for finished jobs

use std::sync::Arc;

use qrun_common::JOB_NAME_LABEL_KEY;
use tracing::debug;

use crate::client::ClusterClient;
use crate::error::ExecError;
use crate::identity::JobIdentity;
use crate::watch::newest_pod;

/// Reads the log of the pod a Job ran. One lookup, no retry.
pub struct LogRetriever {
    client: Arc<dyn ClusterClient>,
}

impl LogRetriever {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    pub async fn retrieve(&self, identity: &JobIdentity) -> Result<String, ExecError> {
        let name = identity.name();
        let selector = format!("{}={}", JOB_NAME_LABEL_KEY, name);

        let pods = self
            .client
            .list_pods(identity.namespace(), &selector)
            .await
            .map_err(|e| ExecError::log_retrieval(name, format!("listing pods: {}", e)))?;

        let pod_name = newest_pod(pods)
            .and_then(|p| p.metadata.name)
            .ok_or_else(|| ExecError::log_retrieval(name, "no pod found for job"))?;

        let logs = self
            .client
            .pod_logs(identity.namespace(), &pod_name)
            .await
            .map_err(|e| ExecError::log_retrieval(name, format!("reading logs of {}: {}", pod_name, e)))?;

        debug!(job = %name, pod = %pod_name, bytes = logs.len(), "retrieved job output");
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod(name: &str, created: i64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: Some(Time(
                    k8s_openapi::chrono::DateTime::from_timestamp(created, 0).unwrap(),
                )),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reads_logs_of_newest_pod() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_pods()
            .withf(|ns, selector| ns == "default" && selector == "qrun.dev/job=qrun-job-abc123")
            .times(1)
            .returning(|_, _| Ok(vec![pod("old", 1), pod("new", 2)]));
        mock.expect_pod_logs()
            .withf(|_, name| name == "new")
            .times(1)
            .returning(|_, _| Ok("1\n".to_string()));

        let logs = LogRetriever::new(Arc::new(mock))
            .retrieve(&JobIdentity::new("qrun-job-abc123", "default"))
            .await
            .unwrap();
        assert_eq!(logs, "1\n");
    }

    #[tokio::test]
    async fn missing_pod_is_log_retrieval_error() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_pods().times(1).returning(|_, _| Ok(vec![]));
        mock.expect_pod_logs().never();

        let err = LogRetriever::new(Arc::new(mock))
            .retrieve(&JobIdentity::new("qrun-job-abc123", "default"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::LogRetrieval { .. }));
    }

    #[tokio::test]
    async fn log_read_failure_is_not_retried() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_pods()
            .times(1)
            .returning(|_, _| Ok(vec![pod("p", 1)]));
        mock.expect_pod_logs()
            .times(1)
            .returning(|_, _| {
                Err(qrun_common::Error::internal_with_context(
                    "pod_logs",
                    "container not started",
                ))
            });

        let err = LogRetriever::new(Arc::new(mock))
            .retrieve(&JobIdentity::new("qrun-job-abc123", "default"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("container not started"));
    }
}
