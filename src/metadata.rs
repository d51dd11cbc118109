//! Client for the GCE metadata server and the process-wide memoized
//! project ID lookup.
//!
//! On Cloud Run the project ID is not exposed as an environment variable,
//! so it is fetched once from the metadata server and cached for the
//! lifetime of the process, including a failed result.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::env::{EnvProvider, ProcessEnv, GCE_METADATA_HOST_ENV};

/// Host used when `$GCE_METADATA_HOST` is not set.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const PROJECT_ID_PATH: &str = "/computeMetadata/v1/project/project-id";
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error returned by metadata server lookups.
///
/// `Clone` so a single cached failure can be handed to every caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata server request to {path} failed: {message}")]
    Request { path: &'static str, message: String },

    #[error("metadata server returned status {status} for {path}")]
    Status { path: &'static str, status: u16 },

    #[error("metadata server returned an empty project ID")]
    EmptyProjectId,

    #[error("metadata server returned an unusable access token: {0}")]
    InvalidToken(String),
}

/// OAuth2 access token handed out by the metadata server.
#[derive(Clone, Debug)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// HTTP client for the metadata server.
#[derive(Clone, Debug)]
pub struct MetadataClient {
    client: Client,
    base_url: String,
}

impl MetadataClient {
    /// Create a client talking to `host` (`host[:port]`, optionally with an
    /// `http://` prefix).
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("http://{}", host)
        };

        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create a client honoring `$GCE_METADATA_HOST`.
    pub fn from_env(env: &dyn EnvProvider) -> Self {
        Self::new(crate::env::env_or(env, GCE_METADATA_HOST_ENV, DEFAULT_METADATA_HOST))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &'static str) -> Result<reqwest::Response, MetadataError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header(METADATA_FLAVOR_HEADER, "Google")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| MetadataError::Request { path, message: e.to_string() })?;

        if !resp.status().is_success() {
            return Err(MetadataError::Status { path, status: resp.status().as_u16() });
        }
        Ok(resp)
    }

    /// Fetch the hosting project's ID. Not memoized; see [`ProjectIdCache`].
    pub async fn fetch_project_id(&self) -> Result<String, MetadataError> {
        let body = self
            .get(PROJECT_ID_PATH)
            .await?
            .text()
            .await
            .map_err(|e| MetadataError::Request { path: PROJECT_ID_PATH, message: e.to_string() })?;

        let project_id = body.trim();
        if project_id.is_empty() {
            return Err(MetadataError::EmptyProjectId);
        }
        Ok(project_id.to_string())
    }

    /// Fetch an access token for the instance's default service account.
    pub async fn fetch_access_token(&self) -> Result<AccessToken, MetadataError> {
        let requested_at = Instant::now();
        let resp: TokenResponse = self
            .get(TOKEN_PATH)
            .await?
            .json()
            .await
            .map_err(|e| MetadataError::InvalidToken(e.to_string()))?;

        if resp.access_token.is_empty() {
            return Err(MetadataError::InvalidToken("empty access_token".to_string()));
        }

        Ok(AccessToken {
            token: resp.access_token,
            expires_at: requested_at + Duration::from_secs(resp.expires_in),
        })
    }
}

/// Source of the hosting project's ID.
#[async_trait]
pub trait ProjectIdSource: Send + Sync {
    async fn project_id(&self) -> Result<String, MetadataError>;
}

#[async_trait]
impl ProjectIdSource for MetadataClient {
    async fn project_id(&self) -> Result<String, MetadataError> {
        self.fetch_project_id().await
    }
}

/// A project ID known up front, e.g. for local development.
#[derive(Clone, Debug)]
pub struct StaticProjectId(pub String);

#[async_trait]
impl ProjectIdSource for StaticProjectId {
    async fn project_id(&self) -> Result<String, MetadataError> {
        Ok(self.0.clone())
    }
}

/// Memoizes a [`ProjectIdSource`].
///
/// The first caller runs the lookup; callers arriving while it is in flight
/// wait for it; everyone afterwards reads the cached value or error.
pub struct ProjectIdCache {
    source: Arc<dyn ProjectIdSource>,
    cell: OnceCell<Result<String, MetadataError>>,
}

impl ProjectIdCache {
    pub fn new(source: Arc<dyn ProjectIdSource>) -> Self {
        Self { source, cell: OnceCell::new() }
    }

    /// Process-wide cache backed by the metadata server named by the
    /// process environment.
    pub fn global() -> Arc<ProjectIdCache> {
        static GLOBAL: OnceLock<Arc<ProjectIdCache>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                Arc::new(ProjectIdCache::new(Arc::new(MetadataClient::from_env(&ProcessEnv))))
            })
            .clone()
    }

    pub async fn project_id(&self) -> Result<String, MetadataError> {
        self.cell
            .get_or_init(|| async { self.source.project_id().await })
            .await
            .clone()
    }
}
