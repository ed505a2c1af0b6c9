//! In-memory cluster for end-to-end engine tests
//!
//! `FakeCluster` stores ConfigMaps, Secrets, Jobs and Pods, and runs each
//! submitted Job on a background task: the pod starts, "executes" `main.py`
//! from the code ConfigMap with a tiny interpreter, and the Job finishes with
//! the matching status and conditions. Watch events go out over a broadcast
//! channel, with the current state replayed on subscribe the way the kube
//! watcher's initial list does.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use qrun_common::error::api_error;
use qrun_common::Error;
use qrun_exec::client::{ClusterClient, JobEvent, JobEventStream};
use qrun_exec::CODE_FILE;
use tokio::sync::broadcast;

/// Delay between simulated lifecycle steps
const STEP: Duration = Duration::from_millis(5);

#[derive(Default)]
struct Store {
    config_maps: BTreeMap<String, ConfigMap>,
    secrets: BTreeMap<String, Secret>,
    jobs: BTreeMap<String, Job>,
    pods: BTreeMap<String, Pod>,
    logs: BTreeMap<String, String>,
    /// Every mutating call, in order, as "verb kind/name"
    calls: Vec<String>,
    /// Everything ever created, kept after deletion for inspection
    created_config_maps: Vec<ConfigMap>,
    created_secrets: Vec<Secret>,
    created_jobs: Vec<Job>,
}

/// Shared handle; clone freely.
#[derive(Clone)]
pub struct FakeCluster {
    store: Arc<Mutex<Store>>,
    events: broadcast::Sender<JobEvent>,
    hang: Arc<AtomicBool>,
    fail_on: Arc<Mutex<Option<String>>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            events,
            hang: Arc::new(AtomicBool::new(false)),
            fail_on: Arc::new(Mutex::new(None)),
        }
    }

    /// Pods start but never finish
    pub fn hanging(self) -> Self {
        self.hang.store(true, Ordering::SeqCst);
        self
    }

    /// Make one operation (e.g. "create_job") fail with a 500
    pub fn failing_on(self, operation: &str) -> Self {
        *self.fail_on.lock().unwrap() = Some(operation.to_string());
        self
    }

    pub fn client(&self) -> Arc<dyn ClusterClient> {
        Arc::new(self.clone())
    }

    /// Number of objects still stored
    pub fn leftovers(&self) -> usize {
        let s = self.store.lock().unwrap();
        s.config_maps.len() + s.secrets.len() + s.jobs.len() + s.pods.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.store.lock().unwrap().calls.clone()
    }

    pub fn created_config_maps(&self) -> Vec<ConfigMap> {
        self.store.lock().unwrap().created_config_maps.clone()
    }

    pub fn created_secrets(&self) -> Vec<Secret> {
        self.store.lock().unwrap().created_secrets.clone()
    }

    pub fn created_jobs(&self) -> Vec<Job> {
        self.store.lock().unwrap().created_jobs.clone()
    }

    fn check_failure(&self, operation: &str) -> Result<(), Error> {
        if self.fail_on.lock().unwrap().as_deref() == Some(operation) {
            return Err(api_error(500, "InternalError", format!("injected failure in {}", operation)).into());
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.store.lock().unwrap().calls.push(call);
    }

    /// Store a new Job status and broadcast it. Returns false once the Job
    /// has been deleted.
    fn update_job(&self, name: &str, status: JobStatus) -> bool {
        let job = {
            let mut s = self.store.lock().unwrap();
            let Some(job) = s.jobs.get_mut(name) else {
                return false;
            };
            job.status = Some(status);
            job.clone()
        };
        let _ = self.events.send(JobEvent::Applied(job));
        true
    }

    /// Simulated kubelet and job controller for one Job
    async fn run_job(self, job: Job) {
        let Some(name) = job.metadata.name.clone() else {
            return;
        };
        let spec = job
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.clone())
            .unwrap_or_default();
        let labels = job
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone());

        tokio::time::sleep(STEP).await;
        if !self.update_job(&name, JobStatus::default()) {
            return;
        }

        tokio::time::sleep(STEP).await;
        let pod_name = format!("{}-x7k2p", name);
        let (output, exit_code) = self.execute_pod(&spec);
        {
            let mut s = self.store.lock().unwrap();
            if !s.jobs.contains_key(&name) {
                return;
            }
            s.pods.insert(
                pod_name.clone(),
                Pod {
                    metadata: ObjectMeta {
                        name: Some(pod_name.clone()),
                        labels,
                        creation_timestamp: Some(Time(k8s_openapi::chrono::Utc::now())),
                        ..Default::default()
                    },
                    spec: Some(spec),
                    ..Default::default()
                },
            );
            s.logs.insert(pod_name, output);
        }
        if !self.update_job(
            &name,
            JobStatus {
                active: Some(1),
                ..Default::default()
            },
        ) {
            return;
        }

        if self.hang.load(Ordering::SeqCst) {
            return;
        }

        tokio::time::sleep(STEP).await;
        let finished = if exit_code == 0 {
            JobStatus {
                succeeded: Some(1),
                conditions: Some(vec![condition("SuccessCriteriaMet"), condition("Complete")]),
                ..Default::default()
            }
        } else {
            JobStatus {
                failed: Some(1),
                ..Default::default()
            }
        };
        self.update_job(&name, finished);
    }

    /// Resolve the code and env the pod would see, then run it.
    fn execute_pod(&self, spec: &PodSpec) -> (String, i32) {
        let s = self.store.lock().unwrap();

        let Some(container) = spec.containers.first() else {
            return ("no containers\n".to_string(), 1);
        };

        // Env must resolve through existing Secrets
        for var in container.env.iter().flatten() {
            let Some(selector) = var.value_from.as_ref().and_then(|v| v.secret_key_ref.as_ref())
            else {
                continue;
            };
            let present = s
                .secrets
                .get(&selector.name)
                .and_then(|secret| secret.data.as_ref())
                .is_some_and(|d| d.contains_key(&selector.key));
            if !present {
                return (format!("secret {} key {} not found\n", selector.name, selector.key), 1);
            }
        }

        let code = spec
            .volumes
            .iter()
            .flatten()
            .filter_map(|v| v.config_map.as_ref())
            .filter_map(|source| s.config_maps.get(&source.name))
            .find_map(|cm| cm.data.as_ref().and_then(|d| d.get(CODE_FILE)).cloned());

        match code {
            Some(code) => interpret(&code),
            None => (
                "python: can't open file '/app/main.py': [Errno 2] No such file or directory\n"
                    .to_string(),
                2,
            ),
        }
    }
}

fn condition(type_: &str) -> JobCondition {
    JobCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        last_transition_time: Some(Time(k8s_openapi::chrono::Utc::now())),
        ..Default::default()
    }
}

/// Just enough Python: `print(<literal>)` lines and `raise`.
fn interpret(code: &str) -> (String, i32) {
    let mut out = String::new();
    for line in code.lines().map(str::trim) {
        if let Some(arg) = line.strip_prefix("print(").and_then(|l| l.strip_suffix(')')) {
            out.push_str(arg.trim_matches(|c| c == '\'' || c == '"'));
            out.push('\n');
        } else if let Some(exc) = line.strip_prefix("raise ") {
            out.push_str("Traceback (most recent call last):\n");
            out.push_str(exc);
            out.push('\n');
            return (out, 1);
        }
    }
    (out, 0)
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

fn not_found(kind: &str, name: &str) -> Error {
    api_error(404, "NotFound", format!("{} \"{}\" not found", kind, name)).into()
}

fn already_exists(kind: &str, name: &str) -> Error {
    api_error(409, "AlreadyExists", format!("{} \"{}\" already exists", kind, name)).into()
}

fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        let Some((key, value)) = term.split_once('=') else {
            return false;
        };
        meta.labels
            .as_ref()
            .and_then(|l| l.get(key))
            .is_some_and(|v| v == value)
    })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_config_map(&self, _namespace: &str, cm: &ConfigMap) -> Result<ConfigMap, Error> {
        self.check_failure("create_config_map")?;
        let name = name_of(&cm.metadata);
        self.record(format!("create configmap/{}", name));
        let mut s = self.store.lock().unwrap();
        if s.config_maps.contains_key(&name) {
            return Err(already_exists("configmaps", &name));
        }
        s.config_maps.insert(name, cm.clone());
        s.created_config_maps.push(cm.clone());
        Ok(cm.clone())
    }

    async fn delete_config_map(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.check_failure("delete_config_map")?;
        self.record(format!("delete configmap/{}", name));
        match self.store.lock().unwrap().config_maps.remove(name) {
            Some(_) => Ok(()),
            None => Err(not_found("configmaps", name)),
        }
    }

    async fn create_secret(&self, _namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        self.check_failure("create_secret")?;
        let name = name_of(&secret.metadata);
        self.record(format!("create secret/{}", name));
        let mut s = self.store.lock().unwrap();
        if s.secrets.contains_key(&name) {
            return Err(already_exists("secrets", &name));
        }
        s.secrets.insert(name, secret.clone());
        s.created_secrets.push(secret.clone());
        Ok(secret.clone())
    }

    async fn delete_secret(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.check_failure("delete_secret")?;
        self.record(format!("delete secret/{}", name));
        match self.store.lock().unwrap().secrets.remove(name) {
            Some(_) => Ok(()),
            None => Err(not_found("secrets", name)),
        }
    }

    async fn create_job(&self, _namespace: &str, job: &Job) -> Result<Job, Error> {
        self.check_failure("create_job")?;
        let name = name_of(&job.metadata);
        self.record(format!("create job/{}", name));
        {
            let mut s = self.store.lock().unwrap();
            if s.jobs.contains_key(&name) {
                return Err(already_exists("jobs.batch", &name));
            }
            s.jobs.insert(name, job.clone());
            s.created_jobs.push(job.clone());
        }
        tokio::spawn(self.clone().run_job(job.clone()));
        Ok(job.clone())
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.check_failure("delete_job")?;
        self.record(format!("delete job/{}", name));
        let removed = {
            let mut s = self.store.lock().unwrap();
            let removed = s.jobs.remove(name);
            if removed.is_some() {
                // Foreground propagation: pods go with the Job
                s.pods.retain(|_, pod| {
                    !pod.metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(qrun_common::JOB_NAME_LABEL_KEY))
                        .is_some_and(|j| j == name)
                });
            }
            removed
        };
        match removed {
            Some(job) => {
                let _ = self.events.send(JobEvent::Deleted(job));
                Ok(())
            }
            None => Err(not_found("jobs.batch", name)),
        }
    }

    async fn get_job(&self, _namespace: &str, name: &str) -> Result<Job, Error> {
        self.check_failure("get_job")?;
        self.store
            .lock()
            .unwrap()
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("jobs.batch", name))
    }

    async fn list_pods(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        self.check_failure("list_pods")?;
        Ok(self
            .store
            .lock()
            .unwrap()
            .pods
            .values()
            .filter(|p| matches_selector(&p.metadata, label_selector))
            .cloned()
            .collect())
    }

    async fn pod_logs(&self, _namespace: &str, pod_name: &str) -> Result<String, Error> {
        self.check_failure("pod_logs")?;
        self.store
            .lock()
            .unwrap()
            .logs
            .get(pod_name)
            .cloned()
            .ok_or_else(|| not_found("pods", pod_name))
    }

    async fn watch_job(
        &self,
        _namespace: &str,
        label_selector: &str,
        name: &str,
    ) -> Result<JobEventStream, Error> {
        self.check_failure("watch_job")?;

        // Subscribe before the snapshot so no update falls in between
        let rx = self.events.subscribe();
        let current = self.store.lock().unwrap().jobs.get(name).cloned();

        let selector = label_selector.to_string();
        let wanted = name.to_string();
        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| {
            let job = match event {
                JobEvent::Applied(job) | JobEvent::Deleted(job) => job,
            };
            let keep = job.metadata.name.as_deref() == Some(wanted.as_str())
                && matches_selector(&job.metadata, &selector);
            futures::future::ready(keep)
        });

        let initial = stream::iter(current.map(JobEvent::Applied));
        Ok(initial.chain(live).map(Ok).boxed())
    }
}
