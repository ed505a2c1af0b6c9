//! Creation and removal of the objects backing one execution
//!
//! For identity `N` the provisioner owns:
//! - ConfigMap `N` with key `main.py` holding the code
//! - Opaque Secret `N` with one key per environment variable
//! - dockerconfigjson Secret `N-regcred` when a registry credential is given
//! - Job `N`
//!
//! Supporting objects are created strictly before the Job so its pod never
//! starts against missing volumes or secret refs.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use qrun_common::{
    JOB_TYPE_EXECUTION, JOB_TYPE_LABEL_KEY, LABEL_MANAGED_BY, LABEL_MANAGED_BY_QRUN,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::client::ClusterClient;
use crate::environment::EnvironmentSet;
use crate::error::ExecError;
use crate::identity::JobIdentity;
use crate::template::ExecutionTemplate;
use crate::CODE_FILE;

/// Registry assumed for `user/image` references
pub const DOCKER_HUB_REGISTRY: &str = "https://index.docker.io/v1/";

const DOCKERCONFIG_KEY: &str = ".dockerconfigjson";
const DOCKERCONFIG_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Pull credentials for one registry, derived from the image reference.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub registry: String,
    pub user: String,
    credential: String,
}

impl RegistryAuth {
    /// Derive registry and user from the image path:
    /// - `user/image` → Docker Hub, user from the first segment
    /// - `registry/user/image...` → first segment is the registry, second the user
    pub fn derive(image: &str, credential: &str) -> Result<Self, ExecError> {
        let segments: Vec<&str> = image.split('/').collect();
        let (registry, user) = match segments.as_slice() {
            [user, _] => (DOCKER_HUB_REGISTRY, *user),
            [registry, user, _, ..] => (*registry, *user),
            _ => {
                return Err(ExecError::configuration(format!(
                    "cannot derive registry user from image '{}': expected user/image or registry/user/image",
                    image
                )))
            }
        };
        if user.is_empty() || registry.is_empty() {
            return Err(ExecError::configuration(format!(
                "image '{}' has an empty registry or user segment",
                image
            )));
        }

        Ok(Self {
            registry: registry.to_string(),
            user: user.to_string(),
            credential: credential.to_string(),
        })
    }

    /// base64(`user:credential`)
    pub fn auth_blob(&self) -> String {
        BASE64.encode(format!("{}:{}", self.user, self.credential))
    }

    /// `{"auths": {<registry>: {"auth": <blob>}}}`
    pub fn docker_config(&self) -> String {
        let mut auths = serde_json::Map::new();
        auths.insert(self.registry.clone(), json!({ "auth": self.auth_blob() }));
        json!({ "auths": auths }).to_string()
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("registry", &self.registry)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_QRUN.to_string(),
    )])
}

fn metadata(name: &str, identity: &JobIdentity) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(identity.namespace().to_string()),
        labels: Some(managed_labels()),
        ..Default::default()
    }
}

/// ConfigMap holding the code verbatim under `main.py`
pub fn build_code_config_map(identity: &JobIdentity, code: &str) -> ConfigMap {
    ConfigMap {
        metadata: metadata(identity.code_holder(), identity),
        data: Some(BTreeMap::from([(CODE_FILE.to_string(), code.to_string())])),
        ..Default::default()
    }
}

/// Immutable Opaque Secret, one key per variable
pub fn build_env_secret(identity: &JobIdentity, env: &EnvironmentSet) -> Secret {
    Secret {
        metadata: metadata(identity.env_holder(), identity),
        type_: Some("Opaque".to_string()),
        immutable: Some(true),
        data: Some(env.secret_data()),
        ..Default::default()
    }
}

/// Immutable dockerconfigjson Secret for pulling the image
pub fn build_registry_secret(identity: &JobIdentity, auth: &RegistryAuth) -> Secret {
    Secret {
        metadata: metadata(&identity.registry_holder(), identity),
        type_: Some(DOCKERCONFIG_TYPE.to_string()),
        immutable: Some(true),
        data: Some(BTreeMap::from([(
            DOCKERCONFIG_KEY.to_string(),
            ByteString(auth.docker_config().into_bytes()),
        )])),
        ..Default::default()
    }
}

/// Job wrapping the template. No retries: `backoffLimit` is 0.
pub fn build_job(identity: &JobIdentity, template: ExecutionTemplate) -> Job {
    let mut labels = managed_labels();
    labels.insert(
        JOB_TYPE_LABEL_KEY.to_string(),
        JOB_TYPE_EXECUTION.to_string(),
    );

    Job {
        metadata: ObjectMeta {
            name: Some(identity.name().to_string()),
            namespace: Some(identity.namespace().to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Creates and deletes the per-execution objects.
#[derive(Clone)]
pub struct Provisioner {
    client: Arc<dyn ClusterClient>,
}

impl Provisioner {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Create code holder, environment holder, registry holder (if any),
    /// then the Job. Stops at the first failure; `destroy` cleans up
    /// whatever was created.
    pub async fn create(
        &self,
        identity: &JobIdentity,
        template: ExecutionTemplate,
        code: &str,
        env: &EnvironmentSet,
        registry: Option<&RegistryAuth>,
    ) -> Result<Job, ExecError> {
        let ns = identity.namespace();

        self.client
            .create_config_map(ns, &build_code_config_map(identity, code))
            .await
            .map_err(|e| ExecError::provisioning(format!("ConfigMap {}", identity.code_holder()), e))?;
        debug!(job = %identity.name(), "code ConfigMap created");

        self.client
            .create_secret(ns, &build_env_secret(identity, env))
            .await
            .map_err(|e| ExecError::provisioning(format!("Secret {}", identity.env_holder()), e))?;
        debug!(job = %identity.name(), variables = env.len(), "environment Secret created");

        if let Some(auth) = registry {
            self.client
                .create_secret(ns, &build_registry_secret(identity, auth))
                .await
                .map_err(|e| {
                    ExecError::provisioning(format!("Secret {}", identity.registry_holder()), e)
                })?;
            debug!(job = %identity.name(), registry = %auth.registry, "registry credential Secret created");
        }

        let job = self
            .client
            .create_job(ns, &build_job(identity, template))
            .await
            .map_err(|e| ExecError::provisioning(format!("Job {}", identity.name()), e))?;
        info!(job = %identity.name(), namespace = %ns, "job created");

        Ok(job)
    }

    /// Delete registry holder (if any), environment holder, code holder and
    /// the Job. Never fails; missing objects are expected after partial
    /// creation.
    pub async fn destroy(&self, identity: &JobIdentity, with_registry: bool) {
        let ns = identity.namespace();

        if with_registry {
            let name = identity.registry_holder();
            report("Secret", &name, self.client.delete_secret(ns, &name).await);
        }
        report(
            "Secret",
            identity.env_holder(),
            self.client.delete_secret(ns, identity.env_holder()).await,
        );
        report(
            "ConfigMap",
            identity.code_holder(),
            self.client.delete_config_map(ns, identity.code_holder()).await,
        );
        report(
            "Job",
            identity.name(),
            self.client.delete_job(ns, identity.name()).await,
        );
        info!(job = %identity.name(), "job resources removed");
    }
}

fn report(kind: &str, name: &str, result: Result<(), qrun_common::Error>) {
    match result {
        Ok(()) => debug!(kind, name, "deleted"),
        Err(e) if e.is_not_found() => debug!(kind, name, "already deleted"),
        Err(e) => warn!(kind, name, error = %e, "failed to delete"),
    }
}
