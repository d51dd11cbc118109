use std::sync::{Arc, OnceLock};

use crate::backend::{BackendConnector, CloudLoggingConnector};
use crate::env::{EnvProvider, ProcessEnv};
use crate::metadata::ProjectIdCache;

/// Everything a [`Logger`](crate::logger::Logger) needs from the outside
/// world: the environment, the project ID lookup and the logging backend.
#[derive(Clone)]
pub struct Platform {
    pub env: Arc<dyn EnvProvider>,
    pub project_ids: Arc<ProjectIdCache>,
    pub backend: Arc<dyn BackendConnector>,
}

impl Platform {
    pub fn new(
        env: Arc<dyn EnvProvider>,
        project_ids: Arc<ProjectIdCache>,
        backend: Arc<dyn BackendConnector>,
    ) -> Self {
        Self { env, project_ids, backend }
    }

    /// Process environment, the process-wide project ID cache and the Cloud
    /// Logging API. Built once and shared.
    pub fn from_process() -> Platform {
        static PROCESS: OnceLock<Platform> = OnceLock::new();
        PROCESS
            .get_or_init(|| {
                Platform::new(
                    Arc::new(ProcessEnv),
                    ProjectIdCache::global(),
                    Arc::new(CloudLoggingConnector::from_env(&ProcessEnv)),
                )
            })
            .clone()
    }
}
