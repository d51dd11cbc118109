//! Request-correlated logger.
//!
//! A [`Logger`] writes entries carrying the running service's monitored
//! resource and the request's trace, so the Logs Explorer nests them under
//! the platform's own request log entry. When the service or the request
//! cannot be identified, or the backend cannot be reached, the logger
//! still works but writes to local `tracing` output instead.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use http::HeaderMap;

use crate::backend::{BackendError, LoggerOptions};
use crate::client::{BackendLogger, LoggingClient};
use crate::identity::{self, IdentityError};
use crate::platform::Platform;
use crate::record::{LogEntry, Payload, Severity};
use crate::resource::MonitoredResource;
use crate::sink::SinkError;
use crate::trace::{self, TraceError};

/// Log ID used when none is given. The platform writes request logs under
/// `request_log`, so application entries go to `app_log` alongside them.
pub const DEFAULT_LOG_ID: &str = "app_log";

/// Why a logger fell back to local output, or why closing it failed.
#[derive(thiserror::Error, Debug)]
pub enum LoggerError {
    #[error("cloud_request_log: {0}; falling back to local logging")]
    Identity(#[from] IdentityError),

    #[error("cloud_request_log: {0}; falling back to local logging")]
    Trace(#[from] TraceError),

    #[error("cloud_request_log: {0}; falling back to local logging")]
    Backend(#[from] BackendError),

    #[error("cloud_request_log: flushing log entries failed: {0}")]
    Close(#[from] SinkError),
}

struct Connected {
    logger: BackendLogger,
    resource: MonitoredResource,
    trace: String,
}

/// Writes log entries correlated with one request.
///
/// Always usable: a logger that could not be connected logs locally. Call
/// [`Logger::close`] when done with it so queued entries are delivered.
pub struct Logger {
    client: Mutex<Option<LoggingClient>>,
    connected: Option<Connected>,
}

impl Logger {
    /// Logger for the request with `headers`, using [`DEFAULT_LOG_ID`] and
    /// the process [`Platform`].
    pub async fn new(headers: &HeaderMap) -> (Logger, Option<LoggerError>) {
        Self::with_id(headers, DEFAULT_LOG_ID, LoggerOptions::default()).await
    }

    /// Logger writing under `log_id`, using the process [`Platform`].
    ///
    /// On App Engine the service is identified by `$GOOGLE_CLOUD_PROJECT`,
    /// `$GAE_SERVICE` and `$GAE_VERSION`. Otherwise the project ID is fetched
    /// from the metadata server and `$K_SERVICE`, `$K_REVISION` and
    /// `$K_CONFIGURATION` must be set, as on Cloud Run.
    ///
    /// The returned logger is valid even when an error is returned; it then
    /// logs locally. That happens when:
    ///
    /// 1. any of the aforementioned environment variables are missing, or the
    ///    metadata lookup fails;
    /// 2. the request has no `X-Cloud-Trace-Context` header;
    /// 3. the backend client cannot be created.
    ///
    /// `options.common_resource` has no effect; see [`LoggerOptions`].
    pub async fn with_id(
        headers: &HeaderMap,
        log_id: &str,
        options: LoggerOptions,
    ) -> (Logger, Option<LoggerError>) {
        Self::with_platform(&Platform::from_process(), headers, log_id, options).await
    }

    /// Same as [`Logger::with_id`] against an explicit [`Platform`].
    pub async fn with_platform(
        platform: &Platform,
        headers: &HeaderMap,
        log_id: &str,
        options: LoggerOptions,
    ) -> (Logger, Option<LoggerError>) {
        match Self::connect(platform, headers, log_id, options).await {
            Ok(logger) => (logger, None),
            Err(err) => (Logger::fallback(), Some(err)),
        }
    }

    async fn connect(
        platform: &Platform,
        headers: &HeaderMap,
        log_id: &str,
        options: LoggerOptions,
    ) -> Result<Logger, LoggerError> {
        let info = identity::resolve(platform.env.as_ref(), &platform.project_ids).await?;
        let trace = trace::extract(&info.project_id, headers)?;
        let client = platform.backend.connect(&info.project_id, &options.client).await?;
        let logger = client.logger(log_id, options.common_labels);

        Ok(Logger {
            client: Mutex::new(Some(client)),
            connected: Some(Connected { logger, resource: info.resource, trace }),
        })
    }

    /// Logger that only writes to local output.
    pub fn fallback() -> Logger {
        Logger { client: Mutex::new(None), connected: None }
    }

    /// Whether entries currently go to local output: the logger never
    /// connected, or it has been closed.
    pub fn is_fallback(&self) -> bool {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    pub fn resource(&self) -> Option<&MonitoredResource> {
        self.connected.as_ref().map(|c| &c.resource)
    }

    pub fn trace(&self) -> Option<&str> {
        self.connected.as_ref().map(|c| c.trace.as_str())
    }

    pub fn log_name(&self) -> Option<&str> {
        self.connected.as_ref().map(|c| c.logger.log_name())
    }

    /// Entries the backend client dropped because its queue was full.
    pub fn dropped_entries(&self) -> u64 {
        self.connected.as_ref().map_or(0, |c| c.logger.dropped_entries())
    }

    /// Deliver queued entries and close the backend client.
    ///
    /// Returns the backend's delivery error, if any. A logger without a
    /// backend, or one already closed, returns `Ok(())`. Entries logged
    /// after closing go to local output.
    pub async fn close(&self) -> Result<(), LoggerError> {
        let client = self.client.lock().unwrap_or_else(PoisonError::into_inner).take();
        match client {
            Some(client) => Ok(client.close().await?),
            None => Ok(()),
        }
    }

    /// Log a formatted message with the given severity.
    ///
    /// ```ignore
    /// logger.logf(Severity::Warning, format_args!("{} retries left", n));
    /// ```
    pub fn logf(&self, severity: Severity, args: fmt::Arguments<'_>) {
        match &self.connected {
            Some(connected) => self.submit(connected, severity, Payload::Text(args.to_string())),
            None => log_locally(severity, &args),
        }
    }

    /// Log a payload with the given severity.
    ///
    /// Plain strings become text payloads. For structured payloads build a
    /// [`Payload`] with [`Payload::json`], which only accepts values that
    /// serialize to a JSON object.
    pub fn log(&self, severity: Severity, payload: impl Into<Payload>) {
        let payload = payload.into();
        match &self.connected {
            Some(connected) => self.submit(connected, severity, payload),
            None => log_locally(severity, &payload),
        }
    }

    fn submit(&self, connected: &Connected, severity: Severity, payload: Payload) {
        let entry = LogEntry {
            log_name: connected.logger.log_name().to_string(),
            resource: connected.resource.clone(),
            timestamp: Utc::now(),
            severity,
            payload,
            trace: connected.trace.clone(),
            labels: connected.logger.common_labels().clone(),
        };

        if let Err(entry) = connected.logger.log(entry) {
            log_locally(entry.severity, &entry.payload);
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("log_name", &self.log_name())
            .field("resource", &self.resource())
            .field("trace", &self.trace())
            .finish()
    }
}

macro_rules! leveled {
    ($($fmt_name:ident, $name:ident => $severity:ident;)*) => {
        impl Logger {
            $(
                #[doc = concat!("Calls [`Logger::logf`] with `", stringify!($severity), "` severity.")]
                pub fn $fmt_name(&self, args: fmt::Arguments<'_>) {
                    self.logf(Severity::$severity, args)
                }

                #[doc = concat!("Calls [`Logger::log`] with `", stringify!($severity), "` severity.")]
                pub fn $name(&self, payload: impl Into<Payload>) {
                    self.log(Severity::$severity, payload)
                }
            )*
        }
    };
}

leveled! {
    debugf, debug => Debug;
    infof, info => Info;
    noticef, notice => Notice;
    warningf, warning => Warning;
    errorf, error => Error;
    criticalf, critical => Critical;
    alertf, alert => Alert;
    emergencyf, emergency => Emergency;
}

/// Unstructured local output. `tracing` has fewer levels than Cloud
/// Logging, so the exact severity rides along as a field.
fn log_locally(severity: Severity, message: &dyn fmt::Display) {
    match severity {
        Severity::Debug => tracing::debug!(severity = %severity, "{}", message),
        Severity::Info | Severity::Notice => tracing::info!(severity = %severity, "{}", message),
        Severity::Warning => tracing::warn!(severity = %severity, "{}", message),
        Severity::Error | Severity::Critical | Severity::Alert | Severity::Emergency => {
            tracing::error!(severity = %severity, "{}", message)
        }
    }
}

/// Run `f` with a `tracing` subscriber that records local output, and
/// return what was written.
#[cfg(test)]
pub(crate) fn capture_local_output(f: impl FnOnce()) -> String {
    use std::sync::Arc;

    let buf = Arc::new(Mutex::new(Vec::new()));
    let writer = {
        let buf = Arc::clone(&buf);
        move || CapturedWriter(Arc::clone(&buf))
    };
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::with_default(subscriber, f);

    let bytes = buf.lock().unwrap_or_else(PoisonError::into_inner).clone();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
struct CapturedWriter(std::sync::Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl std::io::Write for CapturedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
