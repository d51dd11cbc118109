//! Request-scoping adapter for axum / tower services.
//!
//! [`RequestLogLayer`] builds a [`Logger`] for every request, makes it
//! available to the handler as a [`RequestLog`] and closes it once the
//! handler is done, also when the handler panics.
//!
//! ```ignore
//! async fn handler(log: RequestLog) -> &'static str {
//!     log.warningf(format_args!("Some important info right here"));
//!     "Hey"
//! }
//!
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .layer(RequestLogLayer::new());
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::FromRequestParts;
use futures_util::FutureExt;
use http::request::Parts;
use http::{Extensions, Request};
use tower::{Layer, Service};

use crate::backend::LoggerOptions;
use crate::logger::{Logger, DEFAULT_LOG_ID};
use crate::platform::Platform;

/// The logger scoped to the current request.
///
/// Take it as a handler argument, or look it up with
/// [`RequestLog::from_extensions`]. If the handler is not wrapped by
/// [`RequestLogLayer`] it is a fallback logger that writes locally, so
/// logging never fails either way.
#[derive(Clone, Debug)]
pub struct RequestLog {
    logger: Arc<Logger>,
    scoped: bool,
}

impl RequestLog {
    fn scoped(logger: Arc<Logger>) -> Self {
        Self { logger, scoped: true }
    }

    /// A request log not tied to any request; everything goes to local
    /// output.
    pub fn unscoped() -> Self {
        Self { logger: Arc::new(Logger::fallback()), scoped: false }
    }

    pub fn from_extensions(extensions: &Extensions) -> Self {
        extensions.get::<RequestLog>().cloned().unwrap_or_else(Self::unscoped)
    }

    /// Whether this came from [`RequestLogLayer`].
    pub fn is_scoped(&self) -> bool {
        self.scoped
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl Deref for RequestLog {
    type Target = Logger;

    fn deref(&self) -> &Logger {
        &self.logger
    }
}

impl<S> FromRequestParts<S> for RequestLog
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RequestLog::from_extensions(&parts.extensions))
    }
}

#[derive(Clone)]
struct Settings {
    platform: Platform,
    log_id: String,
    options: LoggerOptions,
}

/// Layer wrapping services with a per-request [`Logger`].
#[derive(Clone)]
pub struct RequestLogLayer {
    settings: Arc<Settings>,
}

impl RequestLogLayer {
    /// Default log ID and the process [`Platform`].
    pub fn new() -> Self {
        Self::with_platform(Platform::from_process())
    }

    pub fn with_platform(platform: Platform) -> Self {
        Self {
            settings: Arc::new(Settings {
                platform,
                log_id: DEFAULT_LOG_ID.to_string(),
                options: LoggerOptions::default(),
            }),
        }
    }

    pub fn log_id(self, log_id: impl Into<String>) -> Self {
        self.map_settings(|s| s.log_id = log_id.into())
    }

    /// Options passed to every logger. See [`Logger::with_id`].
    pub fn options(self, options: LoggerOptions) -> Self {
        self.map_settings(|s| s.options = options)
    }

    fn map_settings(self, f: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = (*self.settings).clone();
        f(&mut settings);
        Self { settings: Arc::new(settings) }
    }
}

impl Default for RequestLogLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for RequestLogLayer {
    type Service = RequestLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLogService { inner, settings: Arc::clone(&self.settings) }
    }
}

/// Wrap `service` with the default log ID.
pub fn wrap<S>(service: S) -> RequestLogService<S> {
    RequestLogLayer::new().layer(service)
}

/// Wrap `service`, writing under `log_id` with `options`.
pub fn wrap_with_id<S>(
    service: S,
    log_id: impl Into<String>,
    options: LoggerOptions,
) -> RequestLogService<S> {
    RequestLogLayer::new().log_id(log_id).options(options).layer(service)
}

#[derive(Clone)]
pub struct RequestLogService<S> {
    inner: S,
    settings: Arc<Settings>,
}

impl<S, B> Service<Request<B>> for RequestLogService<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        // Keep the service that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let settings = Arc::clone(&self.settings);

        Box::pin(async move {
            let (logger, err) = Logger::with_platform(
                &settings.platform,
                req.headers(),
                &settings.log_id,
                settings.options.clone(),
            )
            .await;
            if let Some(err) = err {
                tracing::debug!(error = %err, "request logger degraded to local output");
            }

            let logger = Arc::new(logger);
            req.extensions_mut().insert(RequestLog::scoped(Arc::clone(&logger)));

            let outcome = AssertUnwindSafe(inner.call(req)).catch_unwind().await;

            if let Err(err) = logger.close().await {
                tracing::warn!(error = %err, "closing request logger failed");
            }

            match outcome {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    }
}
