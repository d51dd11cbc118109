//! Request-scoped Cloud Logging for App Engine and Cloud Run.
//!
//! Application log entries are written with the running service's
//! monitored resource and the request's trace, so the Logs Explorer shows
//! them nested under the platform's own request log entry. Whenever that
//! is not possible, logging keeps working and goes to local `tracing`
//! output instead.

pub mod env;
pub mod metadata;
pub mod resource;
pub mod identity;
pub mod trace;
pub mod record;
pub mod sink;
pub mod memory_sink;
pub mod cloud_logging;
pub mod client;
pub mod backend;
pub mod platform;
pub mod logger;

#[cfg(feature = "axum")]
pub mod middleware;

pub mod init;

pub use backend::LoggerOptions;
pub use logger::{Logger, LoggerError, DEFAULT_LOG_ID};
pub use platform::Platform;
pub use record::{Payload, Severity};
pub use resource::MonitoredResource;

#[cfg(feature = "axum")]
pub use middleware::{wrap, wrap_with_id, RequestLog, RequestLogLayer};
