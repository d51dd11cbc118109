use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resource type App Engine assigns to its own request logs.
pub const GAE_APP_RESOURCE_TYPE: &str = "gae_app";

/// Resource type Cloud Run assigns to its own request logs.
pub const CLOUD_RUN_RESOURCE_TYPE: &str = "cloud_run_revision";

/// Monitored resource attached to every entry so the Logs Explorer can
/// nest application entries under the platform's request entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub labels: BTreeMap<String, String>,
}

impl MonitoredResource {
    pub fn gae_app(project_id: &str, module_id: &str, version_id: &str) -> Self {
        Self::with_labels(
            GAE_APP_RESOURCE_TYPE,
            [
                ("project_id", project_id),
                ("module_id", module_id),
                ("version_id", version_id),
            ],
        )
    }

    pub fn cloud_run_revision(
        project_id: &str,
        service_name: &str,
        revision_name: &str,
        configuration_name: &str,
    ) -> Self {
        Self::with_labels(
            CLOUD_RUN_RESOURCE_TYPE,
            [
                ("project_id", project_id),
                ("service_name", service_name),
                ("revision_name", revision_name),
                ("configuration_name", configuration_name),
            ],
        )
    }

    fn with_labels<const N: usize>(resource_type: &str, labels: [(&str, &str); N]) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}
