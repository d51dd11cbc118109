use crate::metadata::{AccessToken, MetadataClient, MetadataError};
use crate::record::LogEntry;
use crate::sink::{LogSink, SinkError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Public Cloud Logging API.
pub const DEFAULT_LOGGING_ENDPOINT: &str = "https://logging.googleapis.com";

const WRITE_PATH: &str = "/v2/entries:write";
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tokens are refreshed this long before they actually expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Supplies bearer tokens for `entries:write`.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, MetadataError>;
}

/// Tokens for the instance's default service account, cached until shortly
/// before they expire.
pub struct MetadataTokenSource {
    metadata: MetadataClient,
    cached: Mutex<Option<AccessToken>>,
}

impl MetadataTokenSource {
    pub fn new(metadata: MetadataClient) -> Self {
        Self { metadata, cached: Mutex::new(None) }
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn token(&self) -> Result<String, MetadataError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                return Ok(token.token.clone());
            }
        }

        let fresh = self.metadata.fetch_access_token().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

/// A fixed token, for emulators and tests.
#[derive(Clone, Debug)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, MetadataError> {
        Ok(self.0.clone())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteRequest<'a> {
    entries: &'a [LogEntry],
    partial_success: bool,
}

/// Cloud Logging implementation of [`LogSink`] using the REST
/// `entries:write` method.
#[derive(Clone)]
pub struct CloudLoggingSink {
    client: Client,
    endpoint: String,
    tokens: Arc<dyn TokenSource>,
}

impl CloudLoggingSink {
    /// **Parameters**
    /// - `endpoint`: API base URL without path, e.g.
    ///   [`DEFAULT_LOGGING_ENDPOINT`].
    /// - `tokens`: where bearer tokens come from.
    pub fn new(endpoint: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_client(Client::new(), endpoint, tokens)
    }

    /// Same as [`CloudLoggingSink::new`] reusing `client`, so sinks share
    /// its connection pool.
    pub fn with_client(
        client: Client,
        endpoint: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn write_url(&self) -> String {
        format!("{}{}", self.endpoint, WRITE_PATH)
    }
}

#[async_trait]
impl LogSink for CloudLoggingSink {
    async fn write_entries(&self, entries: &[LogEntry]) -> Result<(), SinkError> {
        if entries.is_empty() {
            return Ok(());
        }

        let token = self.tokens.token().await?;
        let body = serde_json::to_vec(&WriteRequest { entries, partial_success: true })
            .map_err(|e| SinkError::Encode(e.to_string()))?;

        let resp = self
            .client
            .post(self.write_url())
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(WRITE_TIMEOUT)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            Err(SinkError::Rejected { status, body })
        }
    }
}
