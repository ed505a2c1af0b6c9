//! Job identity and derived object names

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Prefix of every generated job name
pub const JOB_NAME_PREFIX: &str = "qrun-job";

/// Length of the random suffix
const SUFFIX_LEN: usize = 6;

/// Name and namespace of one execution, plus the names of everything
/// created for it.
///
/// The random suffix keeps concurrent engines apart with high probability;
/// collisions are not detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIdentity {
    name: String,
    namespace: String,
}

impl JobIdentity {
    /// Generate a fresh identity in `namespace`
    pub fn generate(namespace: impl Into<String>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .map(|b| (b as char).to_ascii_lowercase())
            .take(SUFFIX_LEN)
            .collect();
        Self::new(format!("{}-{}", JOB_NAME_PREFIX, suffix), namespace)
    }

    /// Use an explicit name (tests, reproducible runs)
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Job name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace every object lives in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// ConfigMap holding the code
    pub fn code_holder(&self) -> &str {
        &self.name
    }

    /// Secret holding the environment variables
    pub fn env_holder(&self) -> &str {
        &self.name
    }

    /// Secret holding registry credentials
    pub fn registry_holder(&self) -> String {
        format!("{}-regcred", self.name)
    }

    /// Name of an auxiliary object owned by a plugin
    pub fn auxiliary(&self, suffix: &str) -> String {
        format!("{}-{}", self.name, suffix)
    }
}

impl std::fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
