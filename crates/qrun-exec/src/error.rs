//! Execution error taxonomy

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while executing a request.
///
/// `Configuration` and `Environment` are raised before the cluster is
/// touched. Everything else happens after provisioning has begun, so the
/// engine tears down before reporting it.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("failed to load environment from {}: {message}", path.display())]
    Environment { path: PathBuf, message: String },

    #[error("failed to create {object}: {source}")]
    Provisioning {
        object: String,
        source: qrun_common::Error,
    },

    #[error("watch failed for job '{job}': {message}")]
    Watch { job: String, message: String },

    #[error("log retrieval failed for job '{job}': {message}")]
    LogRetrieval { job: String, message: String },

    #[error("job '{job}' was cancelled")]
    Cancelled { job: String },

    #[error("job '{job}' did not finish within {}s", waited.as_secs())]
    Timeout { job: String, waited: Duration },

    #[error("{0}")]
    Cluster(#[from] qrun_common::Error),
}

impl ExecError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn provisioning(object: impl Into<String>, source: qrun_common::Error) -> Self {
        Self::Provisioning {
            object: object.into(),
            source,
        }
    }

    pub fn watch(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Watch {
            job: job.into(),
            message: message.into(),
        }
    }

    pub fn log_retrieval(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LogRetrieval {
            job: job.into(),
            message: message.into(),
        }
    }

    /// True for explicit user interruption
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled { .. })
    }

    /// True for errors raised before any cluster call
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ExecError::Configuration { .. } | ExecError::Environment { .. }
        )
    }
}
