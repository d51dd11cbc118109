//! Environment variable names read by this crate and the key-value
//! provider used to read them.
//!
//! Identity resolution never touches `std::env` directly; it goes through
//! an [`EnvProvider`] so that callers (and tests) can supply their own view
//! of the environment.

use std::collections::HashMap;

/// Project ID as exposed on App Engine.
pub const GOOGLE_CLOUD_PROJECT_ENV: &str = "GOOGLE_CLOUD_PROJECT";

/// App Engine service name.
pub const GAE_SERVICE_ENV: &str = "GAE_SERVICE";

/// App Engine version ID.
pub const GAE_VERSION_ENV: &str = "GAE_VERSION";

/// Cloud Run service name.
pub const K_SERVICE_ENV: &str = "K_SERVICE";

/// Cloud Run revision name.
pub const K_REVISION_ENV: &str = "K_REVISION";

/// Cloud Run configuration name.
pub const K_CONFIGURATION_ENV: &str = "K_CONFIGURATION";

/// Optional override of the metadata server host, e.g. `127.0.0.1:8080`.
pub const GCE_METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

/// Optional override of the Cloud Logging API base URL, e.g. an emulator.
pub const CLOUD_LOGGING_ENDPOINT_ENV: &str = "CLOUD_LOGGING_ENDPOINT";

/// Read-only view of environment variables.
///
/// Implementations return `None` for variables that are unset **or** set to
/// the empty string; the resolver treats both the same way.
pub trait EnvProvider: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// [`EnvProvider`] backed by the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvProvider for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl EnvProvider for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

/// Read an environment variable or fall back to a provided default.
pub fn env_or(env: &dyn EnvProvider, key: &str, default: &str) -> String {
    env.var(key).unwrap_or_else(|| default.to_string())
}
