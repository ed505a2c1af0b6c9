//! Quantum processor template
//!
//! The processor is reached through an authenticated service. Before the main
//! container starts, two init containers run the login handshake:
//! 1. copy `config.json` from the bootstrap ConfigMap into a shared emptyDir
//! 2. `cortex auth login`, which writes the token file next to it
//!
//! The main container then mounts the shared volume and finds a ready token.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, PodSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use qrun_common::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_QRUN};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{
    code_mount, code_volume, pod_template, runner_container, ExecutionTemplate, TemplateInput,
    TemplatePlugin,
};
use crate::client::ClusterClient;
use crate::environment::EnvironmentSet;
use crate::error::ExecError;
use crate::identity::JobIdentity;
use crate::target::Target;

/// Variables the login handshake needs
pub const REQUIRED_VARS: [&str; 3] = ["CORTEX_URL", "CORTEX_USERNAME", "CORTEX_PASSWORD"];

/// Where the shared config and token file live
const CONFIG_MOUNT_PATH: &str = "/cortex/config";
/// Where the bootstrap ConfigMap is projected
const INIT_MOUNT_PATH: &str = "/cortex/init";

const BOOTSTRAP_SUFFIX: &str = "cortex-config";
const CONFIG_KEY: &str = "config.json";
const INIT_VOLUME: &str = "init-config-data";
const SHARED_VOLUME: &str = "shared-config-data";

/// Plugin for `qpu` targets. Remembers which bootstrap ConfigMaps it created
/// so `cleanup` only touches its own objects.
#[derive(Debug, Default)]
pub struct QpuJobPlugin {
    created: Mutex<HashSet<String>>,
}

impl QpuJobPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn bootstrap_name(identity: &JobIdentity) -> String {
        identity.auxiliary(BOOTSTRAP_SUFFIX)
    }

    fn created(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.created.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fail unless every handshake variable is set and non-empty.
fn require_credentials(env: &EnvironmentSet) -> Result<(), ExecError> {
    let missing: Vec<&str> = REQUIRED_VARS
        .into_iter()
        .filter(|key| !env.has_value(key))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ExecError::configuration(format!(
            "qpu target requires environment variables: {}",
            missing.join(", ")
        )))
    }
}

/// `config.json` consumed by `cortex auth login`
fn bootstrap_config(auth_server_url: &str) -> String {
    let config = json!({
        "auth_server_url": auth_server_url,
        "realm": "cortex",
        "client_id": "iqm_client",
        "username": "",
        "tokens_file": format!("{}/tokens.json", CONFIG_MOUNT_PATH),
    });
    config.to_string()
}

fn shared_mount() -> VolumeMount {
    VolumeMount {
        name: SHARED_VOLUME.to_string(),
        mount_path: CONFIG_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

fn init_mount() -> VolumeMount {
    VolumeMount {
        name: INIT_VOLUME.to_string(),
        mount_path: INIT_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

#[async_trait]
impl TemplatePlugin for QpuJobPlugin {
    fn name(&self) -> &'static str {
        "qpu"
    }

    async fn prepare(
        &self,
        client: &dyn ClusterClient,
        target: Target,
        identity: &JobIdentity,
        env: &EnvironmentSet,
    ) -> Result<(), ExecError> {
        if target != Target::Qpu {
            return Ok(());
        }
        require_credentials(env)?;

        let name = Self::bootstrap_name(identity);
        let url = env.get("CORTEX_URL").unwrap_or_default();
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(identity.namespace().to_string()),
                labels: Some(BTreeMap::from([(
                    LABEL_MANAGED_BY.to_string(),
                    LABEL_MANAGED_BY_QRUN.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                CONFIG_KEY.to_string(),
                bootstrap_config(url),
            )])),
            ..Default::default()
        };

        // Tracked before the call: a create that fails on the client may
        // still have landed on the server
        self.created().insert(name.clone());
        client
            .create_config_map(identity.namespace(), &cm)
            .await
            .map_err(|e| ExecError::provisioning(format!("ConfigMap {}", name), e))?;
        info!(job = %identity.name(), configmap = %name, "created auth bootstrap");
        Ok(())
    }

    fn make_template(
        &self,
        input: &TemplateInput<'_>,
    ) -> Result<Option<ExecutionTemplate>, ExecError> {
        if input.target != Target::Qpu {
            return Ok(None);
        }
        require_credentials(input.env)?;

        let env_refs = input.env.secret_refs(input.identity.env_holder());

        let copy_config = Container {
            name: "cortex-config".to_string(),
            image: Some(input.image.to_string()),
            env: Some(env_refs.clone()),
            command: Some(vec!["cp".to_string()]),
            args: Some(vec![
                format!("{}/{}", INIT_MOUNT_PATH, CONFIG_KEY),
                format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY),
            ]),
            volume_mounts: Some(vec![init_mount(), shared_mount()]),
            ..Default::default()
        };

        // $(VAR) is expanded by the kubelet from the secret-backed env
        let login = Container {
            name: "cortex-login".to_string(),
            image: Some(input.image.to_string()),
            env: Some(env_refs.clone()),
            command: Some(vec!["cortex".to_string()]),
            args: Some(
                [
                    "auth",
                    "login",
                    "--username",
                    "$(CORTEX_USERNAME)",
                    "--password",
                    "$(CORTEX_PASSWORD)",
                    "--no-refresh",
                    "--config-file",
                ]
                .into_iter()
                .map(String::from)
                .chain([format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY)])
                .collect(),
            ),
            volume_mounts: Some(vec![shared_mount()]),
            ..Default::default()
        };

        let mut runner = runner_container(input.image, env_refs);
        runner.volume_mounts = Some(vec![shared_mount(), code_mount()]);

        let volumes = vec![
            Volume {
                name: INIT_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Self::bootstrap_name(input.identity),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: SHARED_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            code_volume(input.identity),
        ];

        let spec = PodSpec {
            init_containers: Some(vec![copy_config, login]),
            containers: vec![runner],
            volumes: Some(volumes),
            ..Default::default()
        };

        Ok(Some(pod_template(input, spec)))
    }

    async fn cleanup(&self, client: &dyn ClusterClient, identity: &JobIdentity) {
        let name = Self::bootstrap_name(identity);
        if !self.created().remove(&name) {
            return;
        }

        match client.delete_config_map(identity.namespace(), &name).await {
            Ok(()) => debug!(configmap = %name, "deleted auth bootstrap"),
            Err(e) if e.is_not_found() => debug!(configmap = %name, "auth bootstrap already gone"),
            Err(e) => warn!(configmap = %name, error = %e, "failed to delete auth bootstrap"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use qrun_common::error::api_error;

    fn credentials() -> EnvironmentSet {
        EnvironmentSet::new()
            .with("CORTEX_URL", "https://auth.example.com")
            .with("CORTEX_USERNAME", "alice")
            .with("CORTEX_PASSWORD", "pw")
    }

    fn input<'a>(identity: &'a JobIdentity, env: &'a EnvironmentSet) -> TemplateInput<'a> {
        TemplateInput {
            identity,
            target: Target::Qpu,
            image: "python:3.12-slim",
            env,
            registry_credentials: false,
        }
    }

    #[test]
    fn missing_credentials_fail_before_cluster() {
        let identity = JobIdentity::new("qrun-job-abc123", "default");
        let env = EnvironmentSet::new().with("CORTEX_URL", "https://auth.example.com");

        let err = QpuJobPlugin::new()
            .make_template(&input(&identity, &env))
            .unwrap_err();
        assert!(err.is_configuration());
        let text = err.to_string();
        assert!(text.contains("CORTEX_USERNAME"));
        assert!(text.contains("CORTEX_PASSWORD"));
        assert!(!text.contains("CORTEX_URL,"));
    }

    #[test]
    fn template_runs_login_handshake_first() {
        let identity = JobIdentity::new("qrun-job-abc123", "default");
        let env = credentials();
        let template = QpuJobPlugin::new()
            .make_template(&input(&identity, &env))
            .unwrap()
            .unwrap();
        let spec = template.spec.unwrap();

        let init = spec.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 2);
        assert_eq!(init[0].command.as_ref().unwrap()[0], "cp");
        let login_args = init[1].args.as_ref().unwrap();
        assert!(login_args.contains(&"$(CORTEX_USERNAME)".to_string()));
        assert!(login_args.contains(&"$(CORTEX_PASSWORD)".to_string()));
        assert_eq!(login_args.last().unwrap(), "/cortex/config/config.json");
        // Credentials only reach the pod through secret refs
        assert!(init[1]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .all(|v| v.value.is_none()));

        let mounts: Vec<&str> = spec.containers[0]
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert_eq!(mounts, vec!["/cortex/config", "/app"]);

        let volumes = spec.volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0].config_map.as_ref().unwrap().name,
            "qrun-job-abc123-cortex-config"
        );
        assert!(volumes[1].empty_dir.is_some());
    }

    #[test]
    fn bootstrap_config_shape() {
        let parsed: serde_json::Value =
            serde_json::from_str(&bootstrap_config("https://auth.example.com")).unwrap();
        assert_eq!(parsed["auth_server_url"], "https://auth.example.com");
        assert_eq!(parsed["realm"], "cortex");
        assert_eq!(parsed["client_id"], "iqm_client");
        assert_eq!(parsed["username"], "");
        assert_eq!(parsed["tokens_file"], "/cortex/config/tokens.json");
    }

    #[tokio::test]
    async fn prepare_and_cleanup_own_the_bootstrap() {
        let identity = JobIdentity::new("qrun-job-abc123", "research");
        let mut mock = MockClusterClient::new();
        mock.expect_create_config_map()
            .withf(|ns, cm| {
                ns == "research"
                    && cm.metadata.name.as_deref() == Some("qrun-job-abc123-cortex-config")
                    && cm.data.as_ref().is_some_and(|d| d.contains_key("config.json"))
            })
            .times(1)
            .returning(|_, cm| Ok(cm.clone()));
        mock.expect_delete_config_map()
            .withf(|ns, name| ns == "research" && name == "qrun-job-abc123-cortex-config")
            .times(1)
            .returning(|_, _| Ok(()));

        let plugin = QpuJobPlugin::new();
        plugin
            .prepare(&mock, Target::Qpu, &identity, &credentials())
            .await
            .unwrap();
        plugin.cleanup(&mock, &identity).await;
        // Second cleanup has nothing left to delete
        plugin.cleanup(&mock, &identity).await;
    }

    #[tokio::test]
    async fn other_targets_touch_nothing() {
        // No expectations: any call panics
        let mock = MockClusterClient::new();
        let identity = JobIdentity::new("qrun-job-abc123", "default");
        let plugin = QpuJobPlugin::new();

        plugin
            .prepare(&mock, Target::Cpu, &identity, &EnvironmentSet::new())
            .await
            .unwrap();
        plugin.cleanup(&mock, &identity).await;
    }

    #[tokio::test]
    async fn failed_bootstrap_is_provisioning_error_and_still_cleaned_up() {
        let identity = JobIdentity::new("qrun-job-abc123", "default");
        let mut mock = MockClusterClient::new();
        mock.expect_create_config_map().times(1).returning(|_, _| {
            Err(qrun_common::Error::internal_with_context(
                "create",
                "request timed out",
            ))
        });
        // The create may have landed; cleanup deletes it and tolerates 404
        mock.expect_delete_config_map()
            .withf(|_, name| name == "qrun-job-abc123-cortex-config")
            .times(1)
            .returning(|_, name| {
                let msg = format!("configmaps \"{}\" not found", name);
                Err(api_error(404, "NotFound", msg).into())
            });

        let plugin = QpuJobPlugin::new();
        let err = plugin
            .prepare(&mock, Target::Qpu, &identity, &credentials())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Provisioning { .. }));

        plugin.cleanup(&mock, &identity).await;
        // Tracking is cleared after the first cleanup
        plugin.cleanup(&mock, &identity).await;
    }
}
