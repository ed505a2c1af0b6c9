//! Job lifecycle watcher
//!
//! Follows one Job through `Scheduled → Running → {Completed, Failed}`.
//! Streaming mode consumes watch events filtered by the managed-job label;
//! poll mode reads Job status with exponential backoff and inspects the
//! runner container's exit code while the pod is active.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use qrun_common::config::{WatchConfig, WatchMode};
use qrun_common::retry::{Backoff, BackoffConfig};
use qrun_common::{JOB_NAME_LABEL_KEY, JOB_TYPE_SELECTOR};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClusterClient, JobEvent};
use crate::error::ExecError;
use crate::identity::JobIdentity;
use crate::request::OutputStream;
use crate::template::RUNNER_CONTAINER;

/// Sink for human-readable progress messages
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Observed lifecycle state of a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Submitted, no pod running yet
    Scheduled,
    /// At least one active pod
    Running,
    /// Finished with a completion condition
    Completed,
    /// Finished without a completion condition
    Failed,
    /// The Job disappeared before reaching a recognizable end state
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Unknown
        )
    }

    /// Which stream the job's output belongs to
    pub fn output_stream(&self) -> OutputStream {
        match self {
            JobState::Completed => OutputStream::Stdout,
            JobState::Failed => OutputStream::Stderr,
            _ => OutputStream::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "Scheduled",
            JobState::Running => "Running",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const COMPLETION_CONDITIONS: [&str; 2] = ["Complete", "SuccessCriteriaMet"];
const FAILURE_CONDITIONS: [&str; 2] = ["Failed", "FailureTarget"];

/// Classify a Job from its status.
///
/// A Job with active pods is `Running`. Once nothing is active and the Job
/// shows any sign of having run (pod counts or a terminal condition), the
/// latest true condition decides: completion means `Completed`, anything
/// else, including no condition at all, means `Failed`.
pub fn observe(job: &Job) -> JobState {
    let Some(status) = job.status.as_ref() else {
        return JobState::Scheduled;
    };

    if status.active.unwrap_or(0) > 0 {
        return JobState::Running;
    }

    let latest_true = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|c| c.status == "True")
        .filter(|c| {
            COMPLETION_CONDITIONS.contains(&c.type_.as_str())
                || FAILURE_CONDITIONS.contains(&c.type_.as_str())
        })
        .max_by_key(|c| c.last_transition_time.as_ref().map(|t| t.0));

    let finished = latest_true.is_some()
        || status.succeeded.unwrap_or(0) > 0
        || status.failed.unwrap_or(0) > 0;
    if !finished {
        return JobState::Scheduled;
    }

    match latest_true {
        Some(c) if COMPLETION_CONDITIONS.contains(&c.type_.as_str()) => JobState::Completed,
        _ => JobState::Failed,
    }
}

/// Terminal state implied by the runner container of `pod`, if it has exited.
pub fn observe_pod(pod: &Pod) -> Option<JobState> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    let runner = statuses
        .iter()
        .find(|s| s.name == RUNNER_CONTAINER)
        .or_else(|| statuses.first())?;
    let terminated = runner.state.as_ref()?.terminated.as_ref()?;
    Some(if terminated.exit_code == 0 {
        JobState::Completed
    } else {
        JobState::Failed
    })
}

/// Newest pod by creation time
pub(crate) fn newest_pod(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter()
        .max_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

/// Remembers the last reported state and reports changes.
struct Transitions<'a> {
    job: &'a str,
    last: Option<JobState>,
    progress: Option<&'a ProgressFn>,
}

impl<'a> Transitions<'a> {
    fn new(job: &'a str, progress: Option<&'a ProgressFn>) -> Self {
        Self {
            job,
            last: None,
            progress,
        }
    }

    /// Returns true when `state` differs from the previous one.
    fn record(&mut self, state: JobState) -> bool {
        if self.last == Some(state) {
            return false;
        }
        info!(job = %self.job, state = %state, "job state changed");
        if let Some(progress) = self.progress {
            progress(&format!("Pod status: {}", state));
        }
        self.last = Some(state);
        true
    }
}

/// Waits for a Job to reach a terminal state.
pub struct LifecycleWatcher {
    client: Arc<dyn ClusterClient>,
    config: WatchConfig,
    progress: Option<ProgressFn>,
}

impl LifecycleWatcher {
    pub fn new(client: Arc<dyn ClusterClient>, config: WatchConfig) -> Self {
        Self {
            client,
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressFn>) -> Self {
        self.progress = progress;
        self
    }

    /// Block until the Job is terminal, `cancel` fires, or the configured
    /// maximum wait elapses.
    pub async fn wait(
        &self,
        identity: &JobIdentity,
        cancel: &CancellationToken,
    ) -> Result<JobState, ExecError> {
        let max_wait = self.config.max_wait();
        let follow = async {
            match self.config.mode {
                WatchMode::Stream => self.follow_stream(identity).await,
                WatchMode::Poll => self.follow_poll(identity).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(job = %identity.name(), "wait cancelled");
                Err(ExecError::Cancelled { job: identity.name().to_string() })
            }
            outcome = tokio::time::timeout(max_wait, follow) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(job = %identity.name(), waited_secs = max_wait.as_secs(), "job did not finish in time");
                    Err(ExecError::Timeout { job: identity.name().to_string(), waited: max_wait })
                }
            },
        }
    }

    async fn follow_stream(&self, identity: &JobIdentity) -> Result<JobState, ExecError> {
        let name = identity.name();
        let mut events = self
            .client
            .watch_job(identity.namespace(), JOB_TYPE_SELECTOR, name)
            .await
            .map_err(|e| ExecError::watch(name, e.to_string()))?;

        let mut transitions = Transitions::new(name, self.progress.as_ref());
        let mut consecutive_errors = 0u32;

        while let Some(event) = events.next().await {
            match event {
                Ok(JobEvent::Applied(job)) => {
                    consecutive_errors = 0;
                    if job.metadata.name.as_deref() != Some(name) {
                        continue;
                    }
                    let state = observe(&job);
                    transitions.record(state);
                    if state.is_terminal() {
                        return Ok(state);
                    }
                }
                Ok(JobEvent::Deleted(job)) => {
                    if job.metadata.name.as_deref() != Some(name) {
                        continue;
                    }
                    warn!(job = %name, "job deleted while waiting");
                    transitions.record(JobState::Unknown);
                    return Ok(JobState::Unknown);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(job = %name, error = %e, attempt = consecutive_errors, "watch error");
                    if consecutive_errors > self.config.max_consecutive_errors {
                        return Err(ExecError::watch(
                            name,
                            format!("{} consecutive watch errors, last: {}", consecutive_errors, e),
                        ));
                    }
                }
            }
        }

        Err(ExecError::watch(
            name,
            "watch stream ended before the job finished",
        ))
    }

    async fn follow_poll(&self, identity: &JobIdentity) -> Result<JobState, ExecError> {
        let name = identity.name();
        let ns = identity.namespace();
        let mut backoff = Backoff::new(BackoffConfig::bounded(
            self.config.poll_interval(),
            self.config.max_poll_interval(),
        ));
        let mut transitions = Transitions::new(name, self.progress.as_ref());
        let mut consecutive_errors = 0u32;

        loop {
            match self.client.get_job(ns, name).await {
                Ok(job) => {
                    consecutive_errors = 0;
                    let mut state = observe(&job);
                    if state == JobState::Running {
                        if let Some(exited) = self.inspect_pod(identity).await {
                            state = exited;
                        }
                    }
                    if transitions.record(state) {
                        backoff.reset();
                    }
                    if state.is_terminal() {
                        return Ok(state);
                    }
                }
                Err(e) if e.is_not_found() => {
                    warn!(job = %name, "job disappeared while waiting");
                    transitions.record(JobState::Unknown);
                    return Ok(JobState::Unknown);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(job = %name, error = %e, attempt = consecutive_errors, "failed to read job status");
                    if consecutive_errors > self.config.max_consecutive_errors {
                        return Err(ExecError::watch(
                            name,
                            format!("{} consecutive status errors, last: {}", consecutive_errors, e),
                        ));
                    }
                }
            }

            let delay = backoff.next_delay();
            debug!(job = %name, delay_ms = delay.as_millis() as u64, "next status poll");
            tokio::time::sleep(delay).await;
        }
    }

    /// Exit state of the runner container, if the pod has one.
    async fn inspect_pod(&self, identity: &JobIdentity) -> Option<JobState> {
        let selector = format!("{}={}", JOB_NAME_LABEL_KEY, identity.name());
        match self.client.list_pods(identity.namespace(), &selector).await {
            Ok(pods) => newest_pod(pods).as_ref().and_then(observe_pod),
            Err(e) => {
                debug!(job = %identity.name(), error = %e, "pod inspection failed");
                None
            }
        }
    }
}
