//! Environment variables injected into execution containers
//!
//! Values only ever reach the cluster inside the environment Secret. The job
//! spec carries `secretKeyRef` entries pointing at that Secret.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, SecretKeySelector};
use k8s_openapi::ByteString;
use tracing::debug;

use crate::error::ExecError;

/// Ordered name → value mapping. Insertion order is kept so the job spec is
/// stable across runs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSet {
    entries: Vec<(String, String)>,
}

impl EnvironmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a dotenv file. A missing file yields an empty set.
    pub fn load(path: &Path) -> Result<Self, ExecError> {
        if !path.exists() {
            debug!(path = %path.display(), "no environment file, using empty environment");
            return Ok(Self::new());
        }

        // Reads the file without touching the process environment
        #[allow(deprecated)]
        let iter = dotenv::from_path_iter(path).map_err(|e| ExecError::Environment {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut env = Self::new();
        for item in iter {
            let (key, value) = item.map_err(|e| ExecError::Environment {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            env.insert(key, value);
        }
        debug!(path = %path.display(), variables = env.len(), "loaded environment");
        Ok(env)
    }

    /// Insert or replace a variable. Replacing keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// True when `key` is present with a non-empty value
    pub fn has_value(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_empty())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Container env entries referencing `secret_name`, one per variable.
    pub fn secret_refs(&self, secret_name: &str) -> Vec<EnvVar> {
        self.keys()
            .map(|key| EnvVar {
                name: key.to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret_name.to_string(),
                        key: key.to_string(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }),
            })
            .collect()
    }

    /// Secret `data` payload. `ByteString` is base64-encoded on the wire.
    pub fn secret_data(&self) -> BTreeMap<String, ByteString> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
            .collect()
    }
}

impl fmt::Debug for EnvironmentSet {
    // Values are secrets; only names are printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentSet")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Self::new();
        for (k, v) in iter {
            env.insert(k, v);
        }
        env
    }
}
