//! Ephemeral job execution engine
//!
//! Runs a piece of user code once on a Kubernetes cluster and hands back its
//! output:
//! - `template` picks the pod template for the target (cpu, gpu, qpu)
//! - `provision` creates the code ConfigMap, environment Secret, optional
//!   registry Secret and the Job, and deletes them again
//! - `watch` follows the Job to a terminal state
//! - `logs` reads the output of the finished pod
//! - `engine` ties these together and guarantees teardown

pub mod client;
pub mod engine;
pub mod environment;
pub mod error;
pub mod identity;
pub mod logs;
pub mod provision;
pub mod request;
pub mod target;
pub mod template;
pub mod watch;

pub use client::{ClusterClient, JobEvent, KubeClusterClient};
pub use engine::ExecutionEngine;
pub use environment::EnvironmentSet;
pub use error::ExecError;
pub use identity::JobIdentity;
pub use request::{ExecutionOutput, ExecutionRequest, ExecutionResult, OutputStream};
pub use target::Target;
pub use template::{TemplatePlugin, TemplateRegistry};
pub use watch::{JobState, ProgressFn};

/// Directory the code ConfigMap is mounted at inside execution containers
pub const WORKSPACE: &str = "/app";

/// ConfigMap key (and file name) holding the submitted code
pub const CODE_FILE: &str = "main.py";
