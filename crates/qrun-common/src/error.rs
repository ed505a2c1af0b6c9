//! Error types shared across qrun crates
//!
//! Errors carry enough context (config source, operation) to be useful
//! in logs without a debugger attached.

use thiserror::Error;

/// Main error type for qrun cluster and configuration operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Engine configuration could not be loaded or is invalid
    #[error("configuration error [{source_name}]: {message}")]
    Config {
        /// Where the configuration came from (file path or env var)
        source_name: String,
        /// Description of what's wrong
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "watch", "create_client")
        context: String,
    },
}

impl Error {
    /// Create a configuration error for the given source
    pub fn config(source_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            source_name: source_name.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the API server answered 404 for the addressed object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Config { source_name, .. } => Some(source_name),
            _ => None,
        }
    }
}

/// Build a `kube::Error` carrying an API status, as the API server would
/// return it. Used by in-memory cluster fakes.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    })
}
