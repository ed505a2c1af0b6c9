//! Common types for qrun: errors, configuration, telemetry and Kubernetes helpers

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use config::EngineConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key carried by every Job the engine submits
pub const JOB_TYPE_LABEL_KEY: &str = "qrun.dev/job-type";

/// Label value identifying engine-managed execution Jobs
pub const JOB_TYPE_EXECUTION: &str = "execution";

/// Label selector matching every engine-managed Job (for watch and list calls)
pub const JOB_TYPE_SELECTOR: &str = "qrun.dev/job-type=execution";

/// Label key on pod templates naming the Job that owns the pod
pub const JOB_NAME_LABEL_KEY: &str = "qrun.dev/job";

/// Label key marking objects created by qrun
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for the managed-by label
pub const LABEL_MANAGED_BY_QRUN: &str = "qrun";

/// Namespace used when neither configuration nor kubeconfig names one
pub const DEFAULT_NAMESPACE: &str = "default";
