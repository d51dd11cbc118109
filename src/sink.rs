use crate::metadata::MetadataError;
use crate::record::LogEntry;
use async_trait::async_trait;

/// Error returned by a [`LogSink`] or by the client worker driving it.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SinkError {
    #[error("log write request failed: {0}")]
    Transport(String),

    #[error("log write rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("could not authorize log write: {0}")]
    Auth(#[from] MetadataError),

    #[error("log entries failed to encode: {0}")]
    Encode(String),

    #[error("log client worker stopped abnormally: {0}")]
    Worker(String),
}

impl SinkError {
    /// Whether writing the same batch again could succeed. Requests the
    /// backend refused with a client error other than 429 fail the same
    /// way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Rejected { status, .. } => !(400..500).contains(status) || *status == 429,
            SinkError::Encode(_) => false,
            _ => true,
        }
    }
}

/// Destination for batches of [`LogEntry`]s.
///
/// Implementations transport entries to a concrete backend (Cloud Logging,
/// an in-memory buffer, ...). The client calls `write_entries` from its
/// background task and never awaits it on the request path.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Write one batch of entries.
    ///
    /// **Returns**
    /// - `Ok(())` if the backend accepted the whole batch.
    /// - `Err(..)` on network, encoding or status errors. The client retries
    ///   the batch with backoff a bounded number of times, unless
    ///   [`SinkError::is_retryable`] says it cannot succeed.
    async fn write_entries(&self, entries: &[LogEntry]) -> Result<(), SinkError>;

    /// Flush anything the sink buffers itself. Called once when the client
    /// closes. Default implementation is a no-op.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
