//! Execution targets

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Hardware backend a piece of code is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// General compute
    Cpu,
    /// Accelerator (GPU) nodes
    Gpu,
    /// Access to a specialized (quantum) processor through an auth handshake
    Qpu,
}

impl Target {
    /// All targets in declaration order
    pub const ALL: [Target; 3] = [Target::Cpu, Target::Gpu, Target::Qpu];

    /// Wire name of the target
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Cpu => "cpu",
            Target::Gpu => "gpu",
            Target::Qpu => "qpu",
        }
    }

    /// Base image used when the caller does not name one
    pub fn default_image(&self) -> &'static str {
        match self {
            Target::Cpu | Target::Qpu => "python:3.12-slim",
            Target::Gpu => "ghcr.io/qubernetes-dev/cuda:12.8.1",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Target::Cpu),
            "gpu" => Ok(Target::Gpu),
            "qpu" => Ok(Target::Qpu),
            other => Err(ExecError::configuration(format!(
                "unknown target '{}', expected one of cpu, gpu, qpu",
                other
            ))),
        }
    }
}
