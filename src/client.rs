//! Backend client: a bounded queue in front of a [`LogSink`], drained by a
//! background task that writes entries in batches.
//!
//! Logging never waits on the network. `close` drains what is queued,
//! flushes the sink and reports the first write that could not be
//! delivered.

use crate::record::LogEntry;
use crate::sink::{LogSink, SinkError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Duration, Instant};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Buffering and delivery settings of a [`LoggingClient`].
///
/// **Fields**
/// - `channel_buffer`: maximum number of queued entries; beyond it new
///   entries are dropped and counted.
/// - `batch_size`: entries per `entries:write` call.
/// - `flush_interval`: longest time a partial batch waits before it is
///   written anyway.
/// - `write_attempts`: attempts per batch before it is given up.
/// - `retry_backoff`: delay before the first retry, doubled per attempt.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub channel_buffer: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub write_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 1024,
            batch_size: 128,
            flush_interval: Duration::from_secs(1),
            write_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    /// Copy of the config with minimal thresholds applied, to avoid
    /// degenerate settings.
    fn normalized(&self) -> Self {
        Self {
            channel_buffer: self.channel_buffer.max(16),
            batch_size: self.batch_size.max(1),
            flush_interval: self.flush_interval.max(Duration::from_millis(10)),
            write_attempts: self.write_attempts.max(1),
            retry_backoff: self.retry_backoff.min(MAX_RETRY_BACKOFF),
        }
    }
}

/// Client for one project's log backend.
///
/// Hands out [`BackendLogger`]s and owns the background writer task.
pub struct LoggingClient {
    project_id: String,
    sender: mpsc::Sender<LogEntry>,
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<Result<(), SinkError>>,
    dropped: Arc<AtomicU64>,
}

impl LoggingClient {
    /// Start a client writing to `sink`. Must be called within a Tokio
    /// runtime.
    pub fn spawn(project_id: &str, sink: Arc<dyn LogSink>, config: &ClientConfig) -> Self {
        let config = config.normalized();
        let (sender, rx) = mpsc::channel(config.channel_buffer);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let worker = tokio::spawn(run_worker(rx, shutdown_rx, sink, config));

        Self {
            project_id: project_id.to_string(),
            sender,
            shutdown,
            worker,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Handle writing to `projects/<project>/logs/<log_id>`.
    pub fn logger(&self, log_id: &str, common_labels: BTreeMap<String, String>) -> BackendLogger {
        BackendLogger {
            log_name: format!(
                "projects/{}/logs/{}",
                self.project_id,
                urlencoding::encode(log_id)
            ),
            common_labels,
            sender: self.sender.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Entries dropped so far because the queue was full.
    pub fn dropped_entries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting entries, write everything still queued, flush the
    /// sink and wait for the worker.
    ///
    /// **Returns**
    /// - `Ok(())` if every batch was delivered.
    /// - `Err(..)` with the first delivery error otherwise.
    pub async fn close(self) -> Result<(), SinkError> {
        let _ = self.shutdown.send(());
        drop(self.sender);
        match self.worker.await {
            Ok(result) => result,
            Err(e) => Err(SinkError::Worker(e.to_string())),
        }
    }
}

/// Per-log handle. Cloning is cheap; logging only enqueues.
#[derive(Clone, Debug)]
pub struct BackendLogger {
    log_name: String,
    common_labels: BTreeMap<String, String>,
    sender: mpsc::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
}

impl BackendLogger {
    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    pub fn common_labels(&self) -> &BTreeMap<String, String> {
        &self.common_labels
    }

    pub fn dropped_entries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue `entry` for delivery.
    ///
    /// A full queue drops the entry. If the client has been closed the
    /// entry is handed back so the caller can log it elsewhere.
    pub fn log(&self, entry: LogEntry) -> Result<(), LogEntry> {
        match self.sender.try_send(entry) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(log_name = %self.log_name, "log queue full, dropping entry");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => Err(entry),
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<LogEntry>,
    mut shutdown: oneshot::Receiver<()>,
    sink: Arc<dyn LogSink>,
    config: ClientConfig,
) -> Result<(), SinkError> {
    let mut batch = Vec::with_capacity(config.batch_size);
    let mut first_err: Option<SinkError> = None;
    let mut ticker = interval_at(Instant::now() + config.flush_interval, config.flush_interval);

    loop {
        tokio::select! {
            Some(entry) = rx.recv() => {
                batch.push(entry);
                if batch.len() >= config.batch_size {
                    keep_first(&mut first_err, write_batch(&*sink, &mut batch, &config).await);
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    keep_first(&mut first_err, write_batch(&*sink, &mut batch, &config).await);
                }
            }
            // Fires on an explicit close and when the client is dropped.
            _ = &mut shutdown => break,
        }
    }

    rx.close();
    while let Some(entry) = rx.recv().await {
        batch.push(entry);
        if batch.len() >= config.batch_size {
            keep_first(&mut first_err, write_batch(&*sink, &mut batch, &config).await);
        }
    }
    if !batch.is_empty() {
        keep_first(&mut first_err, write_batch(&*sink, &mut batch, &config).await);
    }
    keep_first(&mut first_err, sink.flush().await);

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn keep_first(slot: &mut Option<SinkError>, result: Result<(), SinkError>) {
    if let Err(e) = result {
        slot.get_or_insert(e);
    }
}

/// Write `batch`, retrying retryable failures with exponential backoff.
/// The batch is cleared whether or not it was delivered.
async fn write_batch(
    sink: &dyn LogSink,
    batch: &mut Vec<LogEntry>,
    config: &ClientConfig,
) -> Result<(), SinkError> {
    let mut backoff = config.retry_backoff;
    let mut attempt = 1;
    loop {
        match sink.write_entries(batch).await {
            Ok(()) => {
                batch.clear();
                return Ok(());
            }
            Err(e) if attempt >= config.write_attempts || !e.is_retryable() => {
                tracing::warn!(error = %e, entries = batch.len(), attempt, "giving up on log batch");
                batch.clear();
                return Err(e);
            }
            Err(e) => {
                tracing::debug!(error = %e, attempt, "log batch write failed, retrying in {:?}", backoff);
                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, MAX_RETRY_BACKOFF);
                attempt += 1;
            }
        }
    }
}
