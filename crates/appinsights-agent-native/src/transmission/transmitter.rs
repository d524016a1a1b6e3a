//! The telemetry channel: batching, delivery, retry, and spool replay.
//!
//! `enqueue` is non-blocking and runs on the caller's thread; worker tasks
//! cut batches, serialize them to gzip'd newline-delimited JSON, and POST
//! them to the ingestion endpoint. Transient failures pause all
//! transmissions through the shared [`TransmissionPolicy`] and redispatch
//! the same batch; after too many consecutive failures the batch moves to
//! the on-disk spool, which a separate drainer replays once the policy
//! reports healthy again. Envelopes are only dropped on permanent
//! rejections or when both the buffer and the spool are full, and the
//! latter is counted.

use crate::config::Config;
use crate::http;
use crate::logger::LogOnce;
use crate::telemetry::envelope::TelemetryItem;
use crate::transmission::buffer::TelemetryBuffer;
use crate::transmission::retry::{classify_status, DeliveryOutcome, TransmissionPolicy};
use crate::transmission::spool::{SpoolRecord, TransmissionSpool};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const CONTENT_TYPE: &str = "application/x-json-stream";
const GZIP_ENCODING: &str = "gzip";

/// Idle poll interval of the batch worker; batches are usually cut earlier
/// via the enqueue notification.
const WORKER_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransmissionError {
    /// Backpressure: the buffer is at capacity and the spool could not take
    /// the envelope either.
    #[error("telemetry buffer is full")]
    BufferFull,

    /// `flush` did not drain everything before its deadline.
    #[error("flush timed out")]
    FlushTimeout,
}

/// What finally happened to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchFate {
    Delivered,
    Spooled,
    Dropped,
    Cancelled,
}

/// Renders a batch as newline-delimited JSON, one envelope per line.
fn serialize_batch(items: &[TelemetryItem]) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::new();
    for item in items {
        body.extend_from_slice(&serde_json::to_vec(item)?);
        body.push(b'\n');
    }
    Ok(body)
}

fn gzip_compress(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Serializes and compresses a batch; returns the body and its
/// content-encoding.
fn encode_batch(items: &[TelemetryItem]) -> Result<(Vec<u8>, String), io::Error> {
    let serialized =
        serialize_batch(items).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((gzip_compress(&serialized)?, GZIP_ENCODING.to_string()))
}

struct ChannelInner {
    config: Arc<Config>,
    client: reqwest::Client,
    buffer: Mutex<TelemetryBuffer>,
    policy: TransmissionPolicy,
    spool: TransmissionSpool,
    notify: Notify,
    cancel: CancellationToken,
    dropped: AtomicU64,
    permanent_log: LogOnce,
}

/// Public handle to the transmission channel.
pub struct TelemetryChannel {
    inner: Arc<ChannelInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryChannel {
    /// Creates a channel with an empty buffer and a healthy policy.
    ///
    /// Construction performs no I/O; the spool directory is created on
    /// first write and workers are only spawned by
    /// [`spawn_workers`](Self::spawn_workers).
    ///
    /// # Arguments
    ///
    /// * `config` - Agent configuration (batching, retry, spool tunables)
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let client = http::get_client(&config);
        let inner = Arc::new(ChannelInner {
            buffer: Mutex::new(TelemetryBuffer::new(config.buffer_max_items)),
            policy: TransmissionPolicy::new(
                config.retry_backoff_base_ms,
                config.retry_backoff_max_ms,
            ),
            spool: TransmissionSpool::new(config.spool_dir.clone(), config.spool_max_bytes),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            dropped: AtomicU64::new(0),
            permanent_log: LogOnce::new(),
            client,
            config,
        });
        Self {
            inner,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the batch workers and the spool drainer. Requires a running
    /// tokio runtime.
    pub fn spawn_workers(&self) {
        let mut workers = lock(&self.workers);
        for _ in 0..self.inner.config.worker_count.max(1) {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move { inner.worker_loop().await }));
        }
        let inner = Arc::clone(&self.inner);
        workers.push(tokio::spawn(async move { inner.drain_spool_loop().await }));
    }

    /// Queues an envelope without blocking.
    ///
    /// Overflow past the buffer cap goes to the spool; when that also fails
    /// the envelope is dropped, counted, and `BufferFull` is returned.
    ///
    /// # Arguments
    ///
    /// * `item` - The envelope; the channel owns it from here until it is
    ///   acknowledged, spooled, or dropped
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Buffered, or persisted to the spool
    /// * `Err(BufferFull)` - Both the buffer and the spool were full; the
    ///   envelope was dropped and counted
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// if let Err(e) = channel.enqueue(item) {
    ///     debug!("telemetry channel rejected envelope: {e}");
    /// }
    /// ```
    pub fn enqueue(&self, item: TelemetryItem) -> Result<(), TransmissionError> {
        self.inner.enqueue(item)
    }

    /// Drains the buffer, driving retries, until empty or the timeout
    /// elapses.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Overall deadline, covering backoff waits
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Everything buffered at call time was delivered,
    ///   spooled, or rejected permanently
    /// * `Err(FlushTimeout)` - The deadline elapsed; the in-flight batch
    ///   was spooled and the rest stays buffered
    pub async fn flush(&self, timeout: Duration) -> Result<(), TransmissionError> {
        self.inner.flush(timeout).await
    }

    /// Flushes with the shutdown deadline, then stops the workers
    /// cooperatively.
    ///
    /// Safe to call once at process shutdown; afterwards the channel
    /// accepts no deliveries (enqueued envelopes stay buffered).
    pub async fn shutdown(&self) {
        let deadline = Duration::from_secs(self.inner.config.shutdown_deadline_secs);
        if self.flush(deadline).await.is_err() {
            warn!("shutdown flush timed out, remaining telemetry stays buffered or spooled");
        }
        self.inner.cancel.cancel();
        let workers = {
            let mut workers = lock(&self.workers);
            std::mem::take(&mut *workers)
        };
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                warn!("transmission worker did not stop cleanly: {e}");
            }
        }
    }

    /// Envelopes dropped because both the buffer and the spool were full.
    ///
    /// # Returns
    ///
    /// The self-metric counter; monotonically increasing for the
    /// channel's lifetime.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Envelopes currently waiting in the in-memory buffer.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        lock(&self.inner.buffer).len()
    }
}

impl ChannelInner {
    fn enqueue(&self, item: TelemetryItem) -> Result<(), TransmissionError> {
        let (rejected, should_notify) = {
            let mut buffer = lock(&self.buffer);
            match buffer.try_add(item, Instant::now()) {
                Ok(()) => (None, buffer.len() >= self.config.batch_max_items),
                Err(item) => (Some(item), false),
            }
        };
        if should_notify {
            self.notify.notify_one();
        }
        match rejected {
            None => Ok(()),
            Some(item) => self.spool_overflow(item),
        }
    }

    /// The buffer cap was exceeded; persist the envelope as a batch of one.
    fn spool_overflow(&self, item: TelemetryItem) -> Result<(), TransmissionError> {
        let encoded = encode_batch(std::slice::from_ref(&item));
        let stored = encoded.and_then(|(body, content_encoding)| {
            self.spool
                .store(&SpoolRecord {
                    body,
                    content_encoding,
                    retry_count: 0,
                })
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        });
        match stored {
            Ok(_) => Ok(()),
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if self.permanent_log.first("buffer-full") {
                    warn!("buffer and spool full, dropping telemetry: {e}");
                }
                Err(TransmissionError::BufferFull)
            }
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.notify.notified() => {}
                () = tokio::time::sleep(WORKER_TICK) => {}
            }
            loop {
                let batch = {
                    let mut buffer = lock(&self.buffer);
                    buffer.cut_batch(
                        Instant::now(),
                        self.config.batch_max_items,
                        Duration::from_millis(self.config.batch_max_age_ms),
                    )
                };
                if batch.is_empty() {
                    break;
                }
                self.send_batch(batch).await;
                if self.cancel.is_cancelled() {
                    break;
                }
            }
        }
        debug!("transmission worker stopped");
    }

    /// Delivers one batch, retrying transient failures until it is
    /// acknowledged, spooled, or dropped.
    async fn send_batch(&self, batch: Vec<TelemetryItem>) -> BatchFate {
        let count = batch.len();
        let (body, content_encoding) = match encode_batch(&batch) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("failed to encode batch of {count}: {e}");
                return BatchFate::Dropped;
            }
        };
        self.send_encoded(body, content_encoding, count).await
    }

    async fn send_encoded(
        &self,
        body: Vec<u8>,
        content_encoding: String,
        count: usize,
    ) -> BatchFate {
        let mut attempts: u32 = 0;
        loop {
            if !self.policy.wait_until_ready(&self.cancel).await {
                // Shutdown while paused: keep the batch durable.
                return self.spool_batch(body, content_encoding, attempts);
            }
            attempts += 1;
            match self.post(&body, &content_encoding).await {
                DeliveryOutcome::Accepted => {
                    self.policy.record_success();
                    debug!("delivered batch of {count} envelopes after {attempts} attempt(s)");
                    return BatchFate::Delivered;
                }
                DeliveryOutcome::Transient(reason) => {
                    let backoff = self.policy.record_failure();
                    debug!(
                        "transient delivery failure ({reason}), attempt {attempts}, backing off {}ms",
                        backoff.as_millis()
                    );
                    if attempts >= self.config.max_dispatch_attempts {
                        return self.spool_batch(body, content_encoding, attempts);
                    }
                }
                DeliveryOutcome::Permanent(status) => {
                    if self.permanent_log.first(&status.to_string()) {
                        error!("ingestion rejected batch with status {status}, dropping");
                    } else {
                        debug!("ingestion rejected batch with status {status}, dropping");
                    }
                    return BatchFate::Dropped;
                }
            }
        }
    }

    fn spool_batch(&self, body: Vec<u8>, content_encoding: String, attempts: u32) -> BatchFate {
        let record = SpoolRecord {
            body,
            content_encoding,
            retry_count: attempts,
        };
        match self.spool.store(&record) {
            Ok(path) => {
                warn!(
                    "batch undeliverable after {attempts} attempt(s), spooled to {}",
                    path.display()
                );
                BatchFate::Spooled
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("failed to spool undeliverable batch: {e}");
                if self.cancel.is_cancelled() {
                    BatchFate::Cancelled
                } else {
                    BatchFate::Dropped
                }
            }
        }
    }

    async fn post(&self, body: &[u8], content_encoding: &str) -> DeliveryOutcome {
        let mut request = self
            .client
            .post(self.config.track_url())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body.to_vec());
        if !content_encoding.is_empty() {
            request = request.header(reqwest::header::CONTENT_ENCODING, content_encoding);
        }
        match request.send().await {
            Ok(response) => classify_status(response.status().as_u16()),
            Err(e) => DeliveryOutcome::Transient(e.to_string()),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), TransmissionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(TransmissionError::FlushTimeout)?;
            let batch = {
                let mut buffer = lock(&self.buffer);
                buffer.force_batch(self.config.batch_max_items)
            };
            if batch.is_empty() {
                return Ok(());
            }
            let count = batch.len();
            let (body, content_encoding) = match encode_batch(&batch) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!("failed to encode batch of {count}: {e}");
                    continue;
                }
            };
            let send = self.send_encoded(body.clone(), content_encoding.clone(), count);
            if tokio::time::timeout(remaining, send).await.is_err() {
                // Out of time mid-send: keep the batch durable and report
                // the timeout.
                self.spool_batch(body, content_encoding, 0);
                return Err(TransmissionError::FlushTimeout);
            }
        }
    }

    async fn drain_spool_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.spool_drain_interval_ms.max(1));
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            if self.policy.is_healthy() {
                self.drain_spool_once().await;
            }
        }
        debug!("spool drainer stopped");
    }

    /// Replays spooled batches oldest-first until the spool is empty or the
    /// policy pauses again.
    async fn drain_spool_once(&self) {
        while self.policy.is_healthy() && !self.cancel.is_cancelled() {
            let next = match self.spool.take_oldest() {
                Ok(next) => next,
                Err(e) => {
                    warn!("spool read failed: {e}");
                    return;
                }
            };
            let Some((path, record)) = next else {
                return;
            };
            match self.post(&record.body, &record.content_encoding).await {
                DeliveryOutcome::Accepted => {
                    self.policy.record_success();
                    self.spool.remove(&path);
                    debug!("replayed spooled batch {}", path.display());
                }
                DeliveryOutcome::Transient(reason) => {
                    self.policy.record_failure();
                    debug!("spool replay hit transient failure ({reason}), pausing");
                    return;
                }
                DeliveryOutcome::Permanent(status) => {
                    self.spool.remove(&path);
                    if self.permanent_log.first(&status.to_string()) {
                        error!("ingestion rejected spooled batch with status {status}, dropping");
                    }
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::telemetry::envelope::{EventData, TelemetryData, SCHEMA_VERSION};
    use std::io::Read;

    fn item(name: &str) -> TelemetryItem {
        TelemetryItem::new(
            "ikey".to_string(),
            "2021-03-01T12:30:45.123456+00:00".to_string(),
            TelemetryData::Event(EventData {
                ver: SCHEMA_VERSION,
                name: name.to_string(),
                ..EventData::default()
            }),
        )
    }

    fn test_config(spool_dir: std::path::PathBuf) -> Arc<Config> {
        let mut config = Config::from_connection_string("InstrumentationKey=ikey").unwrap();
        config.spool_dir = spool_dir;
        config.retry_backoff_base_ms = 5;
        config.retry_backoff_max_ms = 20;
        Arc::new(config)
    }

    #[test]
    fn serializes_one_envelope_per_line() {
        let body = serialize_batch(&[item("a"), item("b")]).unwrap();
        let text = String::from_utf8(body).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["data"]["baseType"], "EventData");
        }
    }

    #[test]
    fn gzip_round_trips() {
        let body = serialize_batch(&[item("a")]).unwrap();
        let compressed = gzip_compress(&body).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, body);
    }

    #[test]
    fn encode_batch_reports_gzip_encoding() {
        let (body, encoding) = encode_batch(&[item("a")]).unwrap();
        assert_eq!(encoding, "gzip");
        assert!(!body.is_empty());
    }

    #[test]
    fn enqueue_overflow_goes_to_spool() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = (*test_config(dir.path().to_path_buf())).clone();
        config.buffer_max_items = 2;
        let channel = TelemetryChannel::new(Arc::new(config));

        channel.enqueue(item("a")).unwrap();
        channel.enqueue(item("b")).unwrap();
        // buffer is full; the third envelope is spooled, not lost
        channel.enqueue(item("c")).unwrap();

        assert_eq!(channel.buffered_count(), 2);
        assert_eq!(channel.inner.spool.file_count(), 1);
        assert_eq!(channel.dropped_count(), 0);

        let (_, record) = channel.inner.spool.take_oldest().unwrap().unwrap();
        assert_eq!(record.content_encoding, "gzip");
        assert_eq!(record.retry_count, 0);
    }

    #[test]
    fn enqueue_drops_and_counts_when_spool_full_too() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = (*test_config(dir.path().to_path_buf())).clone();
        config.buffer_max_items = 1;
        config.spool_max_bytes = 4; // nothing fits
        let channel = TelemetryChannel::new(Arc::new(config));

        channel.enqueue(item("a")).unwrap();
        let err = channel.enqueue(item("b")).unwrap_err();
        assert!(matches!(err, TransmissionError::BufferFull));
        assert_eq!(channel.dropped_count(), 1);
    }

    #[tokio::test]
    async fn flush_of_empty_channel_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let channel = TelemetryChannel::new(test_config(dir.path().to_path_buf()));
        channel
            .flush(Duration::from_millis(100))
            .await
            .unwrap();
    }
}
