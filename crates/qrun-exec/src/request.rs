//! Execution requests and results

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::target::Target;

/// Output returned when the wait was interrupted by the caller
pub const INTERRUPTED_MESSAGE: &str = "Task interrupted by user";

/// Prefix of the output returned for any other failure
pub const FAILURE_MESSAGE: &str = "An error occurred";

/// One piece of code to run once on the cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub code: String,
    pub target: Target,
    pub image: String,
    pub registry_credential: Option<String>,
}

impl ExecutionRequest {
    /// Request using the target's default image and no registry credential
    pub fn new(code: impl Into<String>, target: Target) -> Self {
        Self {
            code: code.into(),
            target,
            image: target.default_image().to_string(),
            registry_credential: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Personal access token for pulling `image` from a private registry
    pub fn with_registry_credential(mut self, credential: impl Into<String>) -> Self {
        let credential = credential.into();
        self.registry_credential = (!credential.is_empty()).then_some(credential);
        self
    }

    pub fn has_registry_credential(&self) -> bool {
        self.registry_credential.is_some()
    }
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("code_len", &self.code.len())
            .field("target", &self.target)
            .field("image", &self.image)
            .field("registry_credential", &self.registry_credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Which stream the captured output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// The job completed
    Stdout,
    /// The job failed, or the engine could not run it
    Stderr,
    /// Terminal state the engine does not recognize
    Unknown,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
            OutputStream::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a run that reached a terminal state and had its logs read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub logs: String,
    pub stream: OutputStream,
}

/// Caller-facing `(text, stream)` shape. Failures carry their cause.
#[derive(Debug)]
pub struct ExecutionResult {
    pub output: String,
    pub stream: OutputStream,
    pub cause: Option<ExecError>,
}

impl ExecutionResult {
    /// Map the engine's tagged result into the caller-facing shape.
    pub fn from_outcome(outcome: Result<ExecutionOutput, ExecError>) -> Self {
        match outcome {
            Ok(out) => Self {
                output: out.logs,
                stream: out.stream,
                cause: None,
            },
            Err(err) if err.is_cancelled() => Self {
                output: INTERRUPTED_MESSAGE.to_string(),
                stream: OutputStream::Stderr,
                cause: Some(err),
            },
            Err(err) => Self {
                output: format!("{}: {}", FAILURE_MESSAGE, err),
                stream: OutputStream::Stderr,
                cause: Some(err),
            },
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.cause.as_ref().is_some_and(ExecError::is_cancelled)
    }

    pub fn into_parts(self) -> (String, OutputStream) {
        (self.output, self.stream)
    }
}
