//! Execution engine
//!
//! One engine owns one job identity. `execute` resolves the template before
//! touching the cluster, then provisions, waits, reads logs and always tears
//! down. Teardown is recorded in a single armed slot and taken exactly once,
//! whether by the execution itself or by [`ExecutionEngine::abort`].

use std::sync::{Arc, Mutex, MutexGuard};

use qrun_common::kube_utils;
use qrun_common::EngineConfig;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::{ClusterClient, KubeClusterClient};
use crate::environment::EnvironmentSet;
use crate::error::ExecError;
use crate::identity::JobIdentity;
use crate::logs::LogRetriever;
use crate::provision::{Provisioner, RegistryAuth};
use crate::request::{ExecutionOutput, ExecutionRequest, ExecutionResult};
use crate::template::{ExecutionTemplate, TemplateInput, TemplateRegistry};
use crate::watch::{LifecycleWatcher, ProgressFn};

/// What teardown has to remove
#[derive(Debug, Clone)]
struct Armed {
    with_registry: bool,
}

#[derive(Debug, Default)]
struct Lifecycle {
    armed: Option<Armed>,
    in_flight: bool,
}

/// Clears `in_flight` when an execution ends, including when its future is
/// dropped, and wakes any waiting `abort`.
struct InFlight<'a> {
    state: &'a Mutex<Lifecycle>,
    settled: &'a Notify,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.state).in_flight = false;
        self.settled.notify_waiters();
    }
}

fn lock(state: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs code once on the cluster and returns its output.
pub struct ExecutionEngine {
    client: Arc<dyn ClusterClient>,
    config: EngineConfig,
    identity: JobIdentity,
    registry: TemplateRegistry,
    environment: Option<EnvironmentSet>,
    progress: Option<ProgressFn>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    settled: Notify,
}

impl ExecutionEngine {
    /// Engine with a fresh identity in `namespace` and the built-in plugins
    pub fn new(client: Arc<dyn ClusterClient>, config: EngineConfig, namespace: &str) -> Self {
        let identity = JobIdentity::generate(config.namespace.as_deref().unwrap_or(namespace));
        let registry = TemplateRegistry::with_builtin(config.accelerator.clone());
        Self {
            client,
            config,
            identity,
            registry,
            environment: None,
            progress: None,
            cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            settled: Notify::new(),
        }
    }

    /// Connect using the inferred kubeconfig
    pub async fn connect(config: EngineConfig) -> Result<Self, ExecError> {
        let conn = kube_utils::create_client(None, config.namespace.as_deref()).await?;
        let client: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(conn.client));
        Ok(Self::new(client, config, &conn.namespace))
    }

    /// Use an explicit identity instead of a generated one
    pub fn with_identity(mut self, identity: JobIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Use `env` instead of loading `config.env_file`
    pub fn with_environment(mut self, env: EnvironmentSet) -> Self {
        self.environment = Some(env);
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Replace the plugin registry
    pub fn with_registry(mut self, registry: TemplateRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    /// Token that interrupts the wait when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `request` and map the outcome to the caller-facing shape.
    ///
    /// Returns `Err` only for configuration problems detected before any
    /// cluster call. Every other failure is reported as a stderr result with
    /// its cause attached.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        match self.run(request).await {
            Err(e) if e.is_configuration() => Err(e),
            outcome => Ok(ExecutionResult::from_outcome(outcome)),
        }
    }

    /// Run `request`, returning the tagged outcome.
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecError> {
        let span = info_span!(
            "execute",
            job = %self.identity.name(),
            target = %request.target
        );
        self.run_inner(request).instrument(span).await
    }

    /// Cancel any in-progress wait and remove whatever was created.
    ///
    /// Returns once teardown has finished. A running execution tears down on
    /// its own exit path; if its future is dropped first, the leftovers are
    /// removed here.
    pub async fn abort(&self) {
        info!(job = %self.identity.name(), "abort requested");
        self.cancel.cancel();

        let settled = self.settled.notified();
        tokio::pin!(settled);
        settled.as_mut().enable();
        if lock(&self.lifecycle).in_flight {
            settled.await;
        }
        self.teardown().await;
    }

    async fn run_inner(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecError> {
        // Everything up to arming is local: no cluster calls
        self.config
            .validate()
            .map_err(|e| ExecError::configuration(e.to_string()))?;
        let env = self.environment()?;
        let registry_auth = request
            .registry_credential
            .as_deref()
            .map(|credential| RegistryAuth::derive(&request.image, credential))
            .transpose()?;
        let template = self.registry.resolve(&TemplateInput {
            identity: &self.identity,
            target: request.target,
            image: &request.image,
            env: &env,
            registry_credentials: registry_auth.is_some(),
        })?;

        let _in_flight = self.arm(Armed {
            with_registry: registry_auth.is_some(),
        })?;

        let outcome = self
            .provision_and_wait(request, &env, template, registry_auth.as_ref())
            .await;

        self.teardown().await;

        match &outcome {
            Ok(out) => info!(stream = %out.stream, bytes = out.logs.len(), "execution finished"),
            Err(e) if e.is_cancelled() => info!("execution interrupted"),
            Err(e) => warn!(error = %e, "execution failed"),
        }
        outcome
    }

    fn environment(&self) -> Result<EnvironmentSet, ExecError> {
        match &self.environment {
            Some(env) => Ok(env.clone()),
            None => EnvironmentSet::load(&self.config.env_file),
        }
    }

    fn arm(&self, armed: Armed) -> Result<InFlight<'_>, ExecError> {
        let mut state = lock(&self.lifecycle);
        if self.cancel.is_cancelled() {
            return Err(ExecError::Cancelled {
                job: self.identity.name().to_string(),
            });
        }
        if state.in_flight {
            return Err(ExecError::configuration(format!(
                "job {} is already executing on this engine",
                self.identity.name()
            )));
        }
        state.armed = Some(armed);
        state.in_flight = true;
        Ok(InFlight {
            state: &self.lifecycle,
            settled: &self.settled,
        })
    }

    async fn provision_and_wait(
        &self,
        request: &ExecutionRequest,
        env: &EnvironmentSet,
        template: ExecutionTemplate,
        registry_auth: Option<&RegistryAuth>,
    ) -> Result<ExecutionOutput, ExecError> {
        let client = self.client.as_ref();

        self.registry
            .prepare_all(client, request.target, &self.identity, env)
            .await?;

        Provisioner::new(self.client.clone())
            .create(&self.identity, template, &request.code, env, registry_auth)
            .await?;
        self.report(&format!("Job {} created", self.identity.name()));

        let state = LifecycleWatcher::new(self.client.clone(), self.config.watch.clone())
            .with_progress(self.progress.clone())
            .wait(&self.identity, &self.cancel)
            .await?;

        let logs = LogRetriever::new(self.client.clone())
            .retrieve(&self.identity)
            .await?;

        Ok(ExecutionOutput {
            logs,
            stream: state.output_stream(),
        })
    }

    /// Destroy provisioned objects and run plugin cleanup, at most once per
    /// arming.
    async fn teardown(&self) {
        let Some(armed) = lock(&self.lifecycle).armed.take() else {
            debug!(job = %self.identity.name(), "nothing to tear down");
            return;
        };

        Provisioner::new(self.client.clone())
            .destroy(&self.identity, armed.with_registry)
            .await;
        self.registry
            .cleanup_all(self.client.as_ref(), &self.identity)
            .await;
    }

    fn report(&self, message: &str) {
        if let Some(progress) = &self.progress {
            progress(message);
        }
    }
}
