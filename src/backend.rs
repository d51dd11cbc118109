use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{ClientConfig, LoggingClient};
use crate::cloud_logging::{CloudLoggingSink, MetadataTokenSource, TokenSource, DEFAULT_LOGGING_ENDPOINT};
use crate::env::{env_or, EnvProvider, CLOUD_LOGGING_ENDPOINT_ENV};
use crate::metadata::MetadataClient;
use crate::resource::MonitoredResource;

/// Options passed through to the backend logger.
#[derive(Clone, Debug, Default)]
pub struct LoggerOptions {
    /// Labels added to every entry written by the logger.
    pub common_labels: BTreeMap<String, String>,
    /// Accepted for parity with other logging clients but has **no
    /// effect**: every entry carries the resource resolved for the running
    /// service, which overrides any common resource.
    pub common_resource: Option<MonitoredResource>,
    /// Buffering and delivery settings of the backend client.
    pub client: ClientConfig,
}

impl LoggerOptions {
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.common_labels.insert(key.into(), value.into());
        self
    }

    pub fn with_common_resource(mut self, resource: MonitoredResource) -> Self {
        self.common_resource = Some(resource);
        self
    }

    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }
}

/// Error type returned when a backend client cannot be created.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("invalid project ID {0:?} for the logging client")]
    InvalidProject(String),

    #[error("invalid logging endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("logging backend unavailable: {0}")]
    Unavailable(String),
}

/// Creates backend clients scoped to a project.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        project_id: &str,
        config: &ClientConfig,
    ) -> Result<LoggingClient, BackendError>;
}

/// Connector for the Cloud Logging API.
///
/// Every client it creates sends through the same HTTP client, so
/// connections to the API are reused across requests.
#[derive(Clone)]
pub struct CloudLoggingConnector {
    http: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn TokenSource>,
}

impl CloudLoggingConnector {
    pub fn new(endpoint: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self { http: reqwest::Client::new(), endpoint: endpoint.into(), tokens }
    }

    /// Connector honoring `$CLOUD_LOGGING_ENDPOINT`, authorized with the
    /// metadata server's default service account token.
    pub fn from_env(env: &dyn EnvProvider) -> Self {
        Self::new(
            env_or(env, CLOUD_LOGGING_ENDPOINT_ENV, DEFAULT_LOGGING_ENDPOINT),
            Arc::new(MetadataTokenSource::new(MetadataClient::from_env(env))),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn validate_project_id(project_id: &str) -> Result<(), BackendError> {
    let valid = !project_id.is_empty()
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '_'));
    if valid {
        Ok(())
    } else {
        Err(BackendError::InvalidProject(project_id.to_string()))
    }
}

#[async_trait]
impl BackendConnector for CloudLoggingConnector {
    async fn connect(
        &self,
        project_id: &str,
        config: &ClientConfig,
    ) -> Result<LoggingClient, BackendError> {
        validate_project_id(project_id)?;

        let lower = self.endpoint.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Err(BackendError::InvalidEndpoint(self.endpoint.clone()));
        }

        let sink = CloudLoggingSink::with_client(
            self.http.clone(),
            self.endpoint.clone(),
            Arc::clone(&self.tokens),
        );
        Ok(LoggingClient::spawn(project_id, Arc::new(sink), config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_logging::StaticToken;
    use std::collections::HashMap;

    fn connector(endpoint: &str) -> CloudLoggingConnector {
        CloudLoggingConnector::new(endpoint, Arc::new(StaticToken("t".into())))
    }

    #[test]
    fn endpoint_override_comes_from_env() {
        let env: HashMap<String, String> =
            [(CLOUD_LOGGING_ENDPOINT_ENV.to_string(), "http://localhost:8085".to_string())]
                .into_iter()
                .collect();
        assert_eq!(CloudLoggingConnector::from_env(&env).endpoint(), "http://localhost:8085");
        assert_eq!(
            CloudLoggingConnector::from_env(&HashMap::new()).endpoint(),
            DEFAULT_LOGGING_ENDPOINT
        );
    }

    #[tokio::test]
    async fn rejects_bad_project_ids() {
        let connector = connector(DEFAULT_LOGGING_ENDPOINT);
        for bad in ["", "projects/p", "has space"] {
            let err = connector.connect(bad, &ClientConfig::default()).await.err();
            assert!(matches!(err, Some(BackendError::InvalidProject(_))), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn rejects_endpoint_without_scheme() {
        let err = connector("logging.googleapis.com")
            .connect("my-project", &ClientConfig::default())
            .await
            .err();
        assert!(matches!(err, Some(BackendError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn connects_for_valid_project() {
        let client = connector(DEFAULT_LOGGING_ENDPOINT)
            .connect("example.com:my-project", &ClientConfig::default())
            .await
            .unwrap();
        assert_eq!(client.project_id(), "example.com:my-project");
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn clients_from_one_connector_all_deliver() {
        use crate::record::{LogEntry, Payload, Severity};
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/entries:write");
                then.status(200).json_body(serde_json::json!({}));
            })
            .await;

        let connector = connector(&server.base_url());
        for request in 0..3 {
            let client = connector.connect("my-project", &ClientConfig::default()).await.unwrap();
            let logger = client.logger("app_log", BTreeMap::new());
            let entry = LogEntry {
                log_name: logger.log_name().to_string(),
                resource: MonitoredResource::gae_app("my-project", "s", "v"),
                timestamp: chrono::Utc::now(),
                severity: Severity::Info,
                payload: Payload::text(format!("request {request}")),
                trace: "projects/my-project/traces/abc".to_string(),
                labels: BTreeMap::new(),
            };
            logger.log(entry).unwrap();
            client.close().await.unwrap();
        }

        mock.assert_calls_async(3).await;
    }

    #[test]
    fn options_builder_collects_labels() {
        let options = LoggerOptions::default()
            .with_label("team", "infra")
            .with_label("tier", "web")
            .with_common_resource(MonitoredResource::gae_app("other", "s", "v"));
        assert_eq!(options.common_labels.len(), 2);
        assert!(options.common_resource.is_some());
    }
}
