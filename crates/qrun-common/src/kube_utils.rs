//! Kubernetes client construction using kube-rs

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

use crate::{Error, DEFAULT_NAMESPACE};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients.
///
/// Watches are long-lived, so this must exceed the server-side watch timeout
/// kube-rs requests (290s).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(295);

/// A connected client plus the namespace the engine should work in.
#[derive(Clone)]
pub struct ClusterConnection {
    /// Connected kube client
    pub client: Client,
    /// Effective namespace (override, kubeconfig context, or `default`)
    pub namespace: String,
}

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(
    kubeconfig: Option<&Path>,
    namespace_override: Option<&str>,
) -> Result<ClusterConnection, Error> {
    create_client_with_timeout(
        kubeconfig,
        namespace_override,
        DEFAULT_CONNECT_TIMEOUT,
        DEFAULT_READ_TIMEOUT,
    )
    .await
}

/// Create a kube client from an optional kubeconfig path with custom timeouts
///
/// Without a path the configuration is inferred (`KUBECONFIG`,
/// `~/.kube/config`, then in-cluster service account).
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    namespace_override: Option<&str>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<ClusterConnection, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    let namespace = resolve_namespace(namespace_override, &config.default_namespace);

    let client = Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })?;
    info!(namespace = %namespace, "kubernetes client ready");

    Ok(ClusterConnection { client, namespace })
}

/// Pick the effective namespace: explicit override, then the kubeconfig
/// context namespace, then `default`.
pub fn resolve_namespace(namespace_override: Option<&str>, context_namespace: &str) -> String {
    namespace_override
        .filter(|ns| !ns.is_empty())
        .or(Some(context_namespace).filter(|ns| !ns.is_empty()))
        .unwrap_or(DEFAULT_NAMESPACE)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_context() {
        assert_eq!(resolve_namespace(Some("research"), "team-a"), "research");
    }

    #[test]
    fn context_namespace_used_without_override() {
        assert_eq!(resolve_namespace(None, "team-a"), "team-a");
        assert_eq!(resolve_namespace(Some(""), "team-a"), "team-a");
    }

    #[test]
    fn falls_back_to_default_namespace() {
        assert_eq!(resolve_namespace(None, ""), DEFAULT_NAMESPACE);
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_reported() {
        let result = create_client(Some(Path::new("/nonexistent/kubeconfig")), None).await;
        match result {
            Err(err) => assert_eq!(err.context(), Some("create_client")),
            Ok(_) => panic!("expected an error for a missing kubeconfig"),
        }
    }
}
