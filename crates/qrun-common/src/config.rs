//! Engine configuration
//!
//! Built from defaults plus either `QRUN_*` environment variables
//! ([`EngineConfig::from_env`]) or a YAML file
//! ([`EngineConfig::from_yaml_file`]). Fields missing from either source keep
//! their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Default dotenv file holding the variables injected into execution containers
pub const DEFAULT_ENV_FILE: &str = ".env.qrun";

/// Top-level configuration for an execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Namespace override. When unset the kubeconfig context namespace is used.
    pub namespace: Option<String>,
    /// Dotenv file read into the execution environment
    pub env_file: PathBuf,
    /// Resource shape for accelerator jobs
    pub accelerator: AcceleratorConfig,
    /// How job progress is observed
    pub watch: WatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            env_file: PathBuf::from(DEFAULT_ENV_FILE),
            accelerator: AcceleratorConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

/// Accelerator resource requests and runtime selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AcceleratorConfig {
    /// Number of accelerator devices requested (and limited)
    pub count: u32,
    /// Memory request and ceiling (Kubernetes quantity)
    pub memory: String,
    /// CPU request and ceiling (Kubernetes quantity)
    pub cpu: String,
    /// Ephemeral storage ceiling (Kubernetes quantity)
    pub ephemeral_storage: String,
    /// RuntimeClass selecting the accelerator container runtime
    pub runtime_class: String,
    /// Extended resource name advertised by the device plugin
    pub resource_name: String,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            count: 1,
            memory: "32Gi".to_string(),
            cpu: "2".to_string(),
            ephemeral_storage: "50Gi".to_string(),
            runtime_class: "nvidia".to_string(),
            resource_name: "nvidia.com/gpu".to_string(),
        }
    }
}

/// Strategy for observing a job until it terminates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Server-pushed watch events filtered by the managed-job label
    #[default]
    Stream,
    /// Periodic status reads with exponential backoff
    Poll,
}

impl std::str::FromStr for WatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "watch" => Ok(WatchMode::Stream),
            "poll" => Ok(WatchMode::Poll),
            other => Err(Error::config(
                "watch mode",
                format!("unknown watch mode '{}', expected 'stream' or 'poll'", other),
            )),
        }
    }
}

/// Bounds for the wait step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchConfig {
    /// Stream or poll
    pub mode: WatchMode,
    /// Base delay between polls (poll mode)
    pub poll_interval_ms: u64,
    /// Ceiling for the backed-off poll delay (poll mode)
    pub max_poll_interval_ms: u64,
    /// Maximum time to wait for a terminal state before giving up
    pub max_wait_secs: u64,
    /// Consecutive watch/poll errors tolerated before the wait fails
    pub max_consecutive_errors: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Stream,
            poll_interval_ms: 1_000,
            max_poll_interval_ms: 10_000,
            max_wait_secs: 3_600,
            max_consecutive_errors: 5,
        }
    }
}

impl WatchConfig {
    /// Base poll interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Poll interval ceiling as a Duration
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    /// Maximum wait as a Duration
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl EngineConfig {
    /// Build configuration from `QRUN_*` environment variables over defaults.
    ///
    /// `MEMORY` is honored as a fallback for `QRUN_GPU_MEMORY`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(ns) = lookup("QRUN_NAMESPACE").filter(|v| !v.is_empty()) {
            config.namespace = Some(ns);
        }
        if let Some(path) = lookup("QRUN_ENV_FILE").filter(|v| !v.is_empty()) {
            config.env_file = PathBuf::from(path);
        }
        if let Some(memory) = lookup("QRUN_GPU_MEMORY").or_else(|| lookup("MEMORY")) {
            config.accelerator.memory = memory;
        }
        if let Some(count) = lookup("QRUN_GPU_COUNT") {
            config.accelerator.count = parse_number("QRUN_GPU_COUNT", &count)?;
        }
        if let Some(mode) = lookup("QRUN_WATCH_MODE") {
            config.watch.mode = mode
                .parse()
                .map_err(|_| Error::config("QRUN_WATCH_MODE", format!("invalid value '{}'", mode)))?;
        }
        if let Some(secs) = lookup("QRUN_MAX_WAIT_SECS") {
            config.watch.max_wait_secs = parse_number("QRUN_MAX_WAIT_SECS", &secs)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file. Missing fields take defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, Error> {
        let source = path.display().to_string();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(&source, format!("failed to read: {}", e)))?;
        Self::from_yaml_str(&data).map_err(|e| match e {
            Error::Config { message, .. } => Error::config(source, message),
            other => other,
        })
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml_str(data: &str) -> Result<Self, Error> {
        let config: EngineConfig = serde_yaml::from_str(data)
            .map_err(|e| Error::config("yaml", format!("failed to parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would produce an unschedulable or unbounded job.
    pub fn validate(&self) -> Result<(), Error> {
        if self.accelerator.count == 0 {
            return Err(Error::config(
                "accelerator.count",
                "accelerator count must be at least 1",
            ));
        }
        if self.accelerator.memory.trim().is_empty() {
            return Err(Error::config("accelerator.memory", "memory must not be empty"));
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(Error::config(
                "watch.pollIntervalMs",
                "poll interval must be greater than zero",
            ));
        }
        if self.watch.max_wait_secs == 0 {
            return Err(Error::config(
                "watch.maxWaitSecs",
                "maximum wait must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| Error::config(key, format!("invalid number '{}': {}", value, e)))
}
