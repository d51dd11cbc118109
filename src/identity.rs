//! Works out which platform the process runs on and who it is there.
//!
//! App Engine wins whenever `$GOOGLE_CLOUD_PROJECT` is set. Otherwise the
//! project ID comes from the metadata server and the Cloud Run variables
//! must be present. Labels from the two platforms are never mixed.

use crate::env::{
    EnvProvider, GAE_SERVICE_ENV, GAE_VERSION_ENV, GOOGLE_CLOUD_PROJECT_ENV, K_CONFIGURATION_ENV,
    K_REVISION_ENV, K_SERVICE_ENV,
};
use crate::metadata::{MetadataError, ProjectIdCache};
use crate::resource::MonitoredResource;

/// Error returned when the running service cannot be identified.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error(
        "$GOOGLE_CLOUD_PROJECT is set so $GAE_SERVICE and $GAE_VERSION are expected to be set, but these are not: {}",
        .missing.join(", ")
    )]
    IncompleteAppEngine { missing: Vec<&'static str> },

    #[error(
        "$GOOGLE_CLOUD_PROJECT is not set and the project ID was fetched from the metadata service, so $K_SERVICE, $K_REVISION and $K_CONFIGURATION are expected to be set, but these are not: {}",
        .missing.join(", ")
    )]
    IncompleteCloudRun { missing: Vec<&'static str> },

    #[error("$GOOGLE_CLOUD_PROJECT is not set and the metadata service lookup failed: {0}")]
    Metadata(#[from] MetadataError),
}

/// Identity of the running service: its project and monitored resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub project_id: String,
    pub resource: MonitoredResource,
}

/// Read each of `keys`, returning the values in order or the list of keys
/// that are missing.
fn require<const N: usize>(
    env: &dyn EnvProvider,
    keys: [&'static str; N],
) -> Result<[String; N], Vec<&'static str>> {
    let values = keys.map(|key| env.var(key));
    let missing: Vec<&'static str> = keys
        .iter()
        .zip(values.iter())
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| *k)
        .collect();

    if missing.is_empty() {
        Ok(values.map(Option::unwrap_or_default))
    } else {
        Err(missing)
    }
}

/// Resolve the running service's identity.
pub async fn resolve(
    env: &dyn EnvProvider,
    project_ids: &ProjectIdCache,
) -> Result<ServiceInfo, IdentityError> {
    if let Some(project_id) = env.var(GOOGLE_CLOUD_PROJECT_ENV) {
        let [service, version] = require(env, [GAE_SERVICE_ENV, GAE_VERSION_ENV])
            .map_err(|missing| IdentityError::IncompleteAppEngine { missing })?;

        return Ok(ServiceInfo {
            resource: MonitoredResource::gae_app(&project_id, &service, &version),
            project_id,
        });
    }

    let project_id = project_ids.project_id().await?;

    let [service, revision, configuration] =
        require(env, [K_SERVICE_ENV, K_REVISION_ENV, K_CONFIGURATION_ENV])
            .map_err(|missing| IdentityError::IncompleteCloudRun { missing })?;

    Ok(ServiceInfo {
        resource: MonitoredResource::cloud_run_revision(
            &project_id,
            &service,
            &revision,
            &configuration,
        ),
        project_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ProjectIdSource;
    use crate::resource::{CLOUD_RUN_RESOURCE_TYPE, GAE_APP_RESOURCE_TYPE};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedProject {
        calls: AtomicUsize,
        result: Result<String, MetadataError>,
    }

    #[async_trait]
    impl ProjectIdSource for FixedProject {
        async fn project_id(&self) -> Result<String, MetadataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn cache(result: Result<String, MetadataError>) -> (Arc<FixedProject>, ProjectIdCache) {
        let source = Arc::new(FixedProject { calls: AtomicUsize::new(0), result });
        (source.clone(), ProjectIdCache::new(source))
    }

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn app_engine_identity() {
        let (source, cache) = cache(Ok("unused".to_string()));
        let env = env(&[
            (GOOGLE_CLOUD_PROJECT_ENV, "my-project"),
            (GAE_SERVICE_ENV, "my-service"),
            (GAE_VERSION_ENV, "my-version"),
        ]);

        let info = resolve(&env, &cache).await.unwrap();

        assert_eq!(info.project_id, "my-project");
        assert_eq!(info.resource, MonitoredResource::gae_app("my-project", "my-service", "my-version"));
        assert_eq!(info.resource.resource_type, GAE_APP_RESOURCE_TYPE);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn app_engine_wins_over_cloud_run_vars() {
        let (_, cache) = cache(Ok("from-metadata".to_string()));
        let env = env(&[
            (GOOGLE_CLOUD_PROJECT_ENV, "my-project"),
            (GAE_SERVICE_ENV, "my-service"),
            (GAE_VERSION_ENV, "my-version"),
            (K_SERVICE_ENV, "run-service"),
            (K_REVISION_ENV, "run-service-00001"),
            (K_CONFIGURATION_ENV, "run-service"),
        ]);

        let info = resolve(&env, &cache).await.unwrap();

        assert_eq!(info.resource.resource_type, GAE_APP_RESOURCE_TYPE);
        assert_eq!(info.resource.label("service_name"), None);
    }

    #[tokio::test]
    async fn app_engine_missing_version_is_named() {
        let (_, cache) = cache(Ok("unused".to_string()));
        let env = env(&[(GOOGLE_CLOUD_PROJECT_ENV, "my-project"), (GAE_SERVICE_ENV, "my-service")]);

        let err = resolve(&env, &cache).await.unwrap_err();

        assert_eq!(err, IdentityError::IncompleteAppEngine { missing: vec![GAE_VERSION_ENV] });
        assert!(err.to_string().contains("these are not: GAE_VERSION"));
    }

    #[tokio::test]
    async fn cloud_run_identity_uses_metadata_project() {
        let (source, cache) = cache(Ok("my-project-from-metadata-server".to_string()));
        let env = env(&[
            (K_SERVICE_ENV, "svc"),
            (K_REVISION_ENV, "svc-00002-abc"),
            (K_CONFIGURATION_ENV, "svc"),
        ]);

        let info = resolve(&env, &cache).await.unwrap();
        let again = resolve(&env, &cache).await.unwrap();

        assert_eq!(info, again);
        assert_eq!(info.project_id, "my-project-from-metadata-server");
        assert_eq!(info.resource.resource_type, CLOUD_RUN_RESOURCE_TYPE);
        assert_eq!(info.resource.label("project_id"), Some("my-project-from-metadata-server"));
        assert_eq!(info.resource.label("revision_name"), Some("svc-00002-abc"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nothing_set_names_both_families() {
        let (_, cache) = cache(Ok("my-project-from-metadata-server".to_string()));

        let err = resolve(&env(&[]), &cache).await.unwrap_err();

        assert_eq!(
            err,
            IdentityError::IncompleteCloudRun {
                missing: vec![K_SERVICE_ENV, K_REVISION_ENV, K_CONFIGURATION_ENV]
            }
        );
        let message = err.to_string();
        assert!(message.contains("$GOOGLE_CLOUD_PROJECT is not set"));
        assert!(message.contains("K_SERVICE"));
    }

    #[tokio::test]
    async fn metadata_failure_propagates() {
        let (_, cache) = cache(Err(MetadataError::Status {
            path: "/computeMetadata/v1/project/project-id",
            status: 503,
        }));
        let env = env(&[(K_SERVICE_ENV, "svc")]);

        let err = resolve(&env, &cache).await.unwrap_err();

        assert!(matches!(err, IdentityError::Metadata(MetadataError::Status { status: 503, .. })));
    }
}
