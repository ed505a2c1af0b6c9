//! Template registry and built-in plugins
//!
//! Each plugin owns one target family. For a given run:
//! - `prepare` is called on every plugin; plugins that don't own the target no-op
//! - `make_template` is called on every plugin; the first template wins
//! - `cleanup` is called on every plugin; each removes only what it created
//!
//! The registry is built per engine, so plugin state is never shared between
//! concurrent executions.

mod cpu;
mod gpu;
mod qpu;

pub use cpu::CpuJobPlugin;
pub use gpu::GpuJobPlugin;
pub use qpu::QpuJobPlugin;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use qrun_common::config::AcceleratorConfig;
use qrun_common::{JOB_NAME_LABEL_KEY, LABEL_MANAGED_BY, LABEL_MANAGED_BY_QRUN};
use tracing::{debug, warn};

use crate::client::ClusterClient;
use crate::environment::EnvironmentSet;
use crate::error::ExecError;
use crate::identity::JobIdentity;
use crate::target::Target;
use crate::{CODE_FILE, WORKSPACE};

/// Pod template produced by a plugin for one run
pub type ExecutionTemplate = PodTemplateSpec;

/// Name of the main container in every template
pub const RUNNER_CONTAINER: &str = "runner";

/// Volume carrying the code ConfigMap
pub const CODE_VOLUME: &str = "app-volume";

/// Everything a plugin needs to build a template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateInput<'a> {
    pub identity: &'a JobIdentity,
    pub target: Target,
    pub image: &'a str,
    pub env: &'a EnvironmentSet,
    /// Whether a registry-credential Secret will exist for this run
    pub registry_credentials: bool,
}

/// A provider of execution templates for one target family.
#[async_trait]
pub trait TemplatePlugin: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Bootstrap target-specific cluster state before submission.
    async fn prepare(
        &self,
        _client: &dyn ClusterClient,
        _target: Target,
        _identity: &JobIdentity,
        _env: &EnvironmentSet,
    ) -> Result<(), ExecError> {
        Ok(())
    }

    /// Build the pod template, or `Ok(None)` when `input.target` is not ours.
    ///
    /// Returns a configuration error when the target is ours but required
    /// inputs are missing.
    fn make_template(
        &self,
        input: &TemplateInput<'_>,
    ) -> Result<Option<ExecutionTemplate>, ExecError>;

    /// Remove whatever `prepare` created. Best-effort: errors are logged.
    async fn cleanup(&self, _client: &dyn ClusterClient, _identity: &JobIdentity) {}
}

/// Ordered list of plugins.
#[derive(Default)]
pub struct TemplateRegistry {
    plugins: Vec<Box<dyn TemplatePlugin>>,
}

impl TemplateRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the cpu, gpu and qpu plugins, in that order
    pub fn with_builtin(accelerator: AcceleratorConfig) -> Self {
        Self::new()
            .with_plugin(CpuJobPlugin)
            .with_plugin(GpuJobPlugin::new(accelerator))
            .with_plugin(QpuJobPlugin::new())
    }

    /// Append a plugin. Earlier plugins take precedence.
    pub fn with_plugin(mut self, plugin: impl TemplatePlugin + 'static) -> Self {
        self.register(Box::new(plugin));
        self
    }

    pub fn register(&mut self, plugin: Box<dyn TemplatePlugin>) {
        self.plugins.push(plugin);
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Ask every plugin for a template; the first one returned is used.
    pub fn resolve(&self, input: &TemplateInput<'_>) -> Result<ExecutionTemplate, ExecError> {
        let mut chosen: Option<(&'static str, ExecutionTemplate)> = None;

        for plugin in &self.plugins {
            let Some(template) = plugin.make_template(input)? else {
                continue;
            };
            match &chosen {
                None => {
                    debug!(plugin = plugin.name(), target = %input.target, "template selected");
                    chosen = Some((plugin.name(), template));
                }
                Some((winner, _)) => {
                    warn!(
                        plugin = plugin.name(),
                        winner = %winner,
                        target = %input.target,
                        "multiple plugins claim target, ignoring later template"
                    );
                }
            }
        }

        chosen.map(|(_, template)| template).ok_or_else(|| {
            ExecError::configuration(format!(
                "no template plugin handles target '{}' (registered: {})",
                input.target,
                self.plugin_names().join(", ")
            ))
        })
    }

    /// Run every plugin's `prepare`, stopping at the first failure.
    pub async fn prepare_all(
        &self,
        client: &dyn ClusterClient,
        target: Target,
        identity: &JobIdentity,
        env: &EnvironmentSet,
    ) -> Result<(), ExecError> {
        for plugin in &self.plugins {
            plugin.prepare(client, target, identity, env).await?;
        }
        Ok(())
    }

    /// Run every plugin's `cleanup`.
    pub async fn cleanup_all(&self, client: &dyn ClusterClient, identity: &JobIdentity) {
        for plugin in &self.plugins {
            plugin.cleanup(client, identity).await;
        }
    }
}

// =============================================================================
// Shared template pieces
// =============================================================================

/// Volume projecting the code ConfigMap
pub(crate) fn code_volume(identity: &JobIdentity) -> Volume {
    Volume {
        name: CODE_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: identity.code_holder().to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Read-only mount of the code volume at the workspace
pub(crate) fn code_mount() -> VolumeMount {
    VolumeMount {
        name: CODE_VOLUME.to_string(),
        mount_path: WORKSPACE.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Main container running the submitted file
pub(crate) fn runner_container(image: &str, env: Vec<EnvVar>) -> Container {
    Container {
        name: RUNNER_CONTAINER.to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["python".to_string()]),
        args: Some(vec![format!("{}/{}", WORKSPACE, CODE_FILE)]),
        env: Some(env),
        ..Default::default()
    }
}

/// Wrap a pod spec with the job label, `restartPolicy: Never` and the
/// registry pull secret when one exists.
pub(crate) fn pod_template(input: &TemplateInput<'_>, mut spec: PodSpec) -> ExecutionTemplate {
    spec.restart_policy = Some("Never".to_string());
    if input.registry_credentials {
        spec.image_pull_secrets = Some(vec![LocalObjectReference {
            name: input.identity.registry_holder(),
        }]);
    }

    let labels = BTreeMap::from([
        (
            JOB_NAME_LABEL_KEY.to_string(),
            input.identity.name().to_string(),
        ),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_QRUN.to_string(),
        ),
    ]);

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(spec),
    }
}
