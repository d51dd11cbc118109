use crate::backend::{BackendConnector, BackendError};
use crate::client::{ClientConfig, LoggingClient};
use crate::record::LogEntry;
use crate::sink::{LogSink, SinkError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A sink that keeps every entry in memory.
///
/// Useful for local development without credentials and for tests that
/// want to look at what would have been written. Clones share storage.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    failing_writes: Arc<AtomicUsize>,
    flushes: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make the next `n` calls to `write_entries` fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn write_entries(&self, entries: &[LogEntry]) -> Result<(), SinkError> {
        let should_fail = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SinkError::Transport("simulated write failure".to_string()));
        }

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(entries);
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`BackendConnector`] handing out clients that write into one shared
/// [`MemorySink`].
#[derive(Clone, Default)]
pub struct MemoryConnector {
    sink: MemorySink,
    unavailable: bool,
}

impl MemoryConnector {
    pub fn new(sink: MemorySink) -> Self {
        Self { sink, unavailable: false }
    }

    /// A connector whose `connect` always fails.
    pub fn unavailable() -> Self {
        Self { sink: MemorySink::new(), unavailable: true }
    }

    pub fn sink(&self) -> &MemorySink {
        &self.sink
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(
        &self,
        project_id: &str,
        config: &ClientConfig,
    ) -> Result<LoggingClient, BackendError> {
        if self.unavailable {
            return Err(BackendError::Unavailable("memory backend marked unavailable".to_string()));
        }
        Ok(LoggingClient::spawn(project_id, Arc::new(self.sink.clone()), config))
    }
}
