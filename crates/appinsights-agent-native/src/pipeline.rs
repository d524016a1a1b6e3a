//! The pipeline coordinator.
//!
//! Wires the mapper's output into both consumers: every envelope derived
//! from a span is validated, observed by the live metrics collector, and
//! queued on the transmission channel. Shutdown flushes the channel first,
//! then closes the live metrics loop. No error leaves `export_span`; the
//! instrumented application never sees the pipeline fail.

use crate::config::Config;
use crate::exporter::Exporter;
use crate::http;
use crate::live_metrics::{QuickPulseDataCollector, QuickPulseSender};
use crate::logger::LogOnce;
use crate::spans::Span;
use crate::telemetry::envelope;
use crate::transmission::TelemetryChannel;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Process-wide telemetry pipeline.
///
/// Construct one per process at startup and pass it explicitly to whatever
/// finalizes spans; there is exactly one outbound tenant.
pub struct TelemetryPipeline {
    config: Arc<Config>,
    exporter: Exporter,
    channel: Arc<TelemetryChannel>,
    collector: Arc<QuickPulseDataCollector>,
    cancel: CancellationToken,
    live_metrics_task: Mutex<Option<JoinHandle<()>>>,
    export_log: LogOnce,
}

impl TelemetryPipeline {
    /// Creates a pipeline from resolved configuration.
    ///
    /// Construction is passive: nothing is spawned and no I/O happens
    /// until [`start`](Self::start) is called, so a pipeline can be built
    /// outside a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `config` - Shared agent configuration (tenant key, endpoints,
    ///   batching and retry tunables)
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let config = Arc::new(Config::from_env()?);
    /// let pipeline = TelemetryPipeline::new(config);
    /// pipeline.start();
    /// ```
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            exporter: Exporter::new(&config),
            channel: Arc::new(TelemetryChannel::new(Arc::clone(&config))),
            collector: Arc::new(QuickPulseDataCollector::new()),
            cancel: CancellationToken::new(),
            live_metrics_task: Mutex::new(None),
            export_log: LogOnce::new(),
            config,
        }
    }

    /// Starts the transmission workers and the live metrics loop.
    ///
    /// Spawns the channel's batch workers and spool drainer plus the
    /// QuickPulse ping/post task; requires a running tokio runtime.
    /// Calling `start` more than once spawns additional workers and is not
    /// intended.
    pub fn start(&self) {
        self.channel.spawn_workers();
        let sender = QuickPulseSender::new(
            http::get_client(&self.config),
            Arc::clone(&self.config),
            Arc::clone(&self.collector),
        );
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move { sender.run(cancel).await });
        *lock(&self.live_metrics_task) = Some(task);
    }

    /// Maps one finished span and fans its envelopes out.
    ///
    /// Each envelope is validated, observed by the live metrics collector
    /// (when a subscriber is attached), and queued on the transmission
    /// channel. Runs synchronously on the caller's thread; the mapper
    /// never blocks on I/O.
    ///
    /// # Arguments
    ///
    /// * `span` - The finished span; the pipeline never mutates it
    ///
    /// # Error Handling
    ///
    /// Infallible from the caller's side. Mapper failures drop the span,
    /// validation failures drop the envelope, and channel backpressure
    /// drops after spooling — each is logged on the agent's own sink, once
    /// per failure kind where flooding is possible.
    pub fn export_span(&self, span: &Span) {
        let items = match self.exporter.map(span) {
            Ok(items) => items,
            Err(e) => {
                if self.export_log.first(&e.to_string()) {
                    warn!("dropping span {}: {e}", span.span_id);
                }
                return;
            }
        };
        for mut item in items {
            if let Err(e) = envelope::validate(&mut item) {
                if self.export_log.first(&e.to_string()) {
                    warn!("dropping envelope from span {}: {e}", span.span_id);
                }
                continue;
            }
            self.collector.add(&item);
            if let Err(e) = self.channel.enqueue(item) {
                debug!("telemetry channel rejected envelope: {e}");
            }
        }
    }

    /// Drains buffered telemetry.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Overall deadline for the drain, including any retry
    ///   backoff it has to wait out
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Everything buffered at call time was delivered or
    ///   spooled
    /// * `Err(FlushTimeout)` - The deadline elapsed first; remaining
    ///   telemetry stays buffered or spooled
    pub async fn flush(
        &self,
        timeout: Duration,
    ) -> Result<(), crate::transmission::TransmissionError> {
        self.channel.flush(timeout).await
    }

    /// Flushes the channel, stops its workers, then closes the live
    /// metrics loop.
    ///
    /// Cancellation is cooperative and bounded by the configured shutdown
    /// deadline (default 30s); telemetry that cannot be delivered in time
    /// is left in the spool rather than dropped.
    pub async fn shutdown(&self) {
        self.channel.shutdown().await;
        self.cancel.cancel();
        let task = lock(&self.live_metrics_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("telemetry pipeline stopped");
    }

    /// The live metrics collector observing this pipeline.
    ///
    /// # Returns
    ///
    /// A shared handle; cloning the `Arc` is cheap and safe across tasks.
    #[must_use]
    pub fn collector(&self) -> Arc<QuickPulseDataCollector> {
        Arc::clone(&self.collector)
    }

    /// The transmission channel owning buffered envelopes.
    ///
    /// # Returns
    ///
    /// A shared handle; cloning the `Arc` is cheap and safe across tasks.
    #[must_use]
    pub fn channel(&self) -> Arc<TelemetryChannel> {
        Arc::clone(&self.channel)
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
    use crate::spans::{SpanKind, SpanStatus};

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN_ID: &str = "00f067aa0ba902b7";

    fn pipeline() -> TelemetryPipeline {
        let dir = std::env::temp_dir().join("appinsights-pipeline-tests");
        let mut config = Config::from_connection_string("InstrumentationKey=ikey-1").unwrap();
        config.spool_dir = dir;
        TelemetryPipeline::new(Arc::new(config))
    }

    fn server_span(trace_state: &str) -> Span {
        Span::builder(TRACE_ID, SPAN_ID)
            .kind(SpanKind::Server)
            .name("/api/x")
            .times(0, 150_000_000)
            .status(SpanStatus::Ok)
            .trace_state(trace_state)
            .build()
    }

    #[test]
    fn span_lands_in_channel_buffer() {
        let pipeline = pipeline();
        pipeline.export_span(&server_span(""));
        assert_eq!(pipeline.channel().buffered_count(), 1);
    }

    #[test]
    fn enabled_collector_observes_envelopes() {
        let pipeline = pipeline();
        pipeline.collector().enable("ikey-1");
        pipeline.export_span(&server_span(""));
        let snapshot = pipeline.collector().get_and_restart().unwrap();
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.requests_duration_ms, 150);
    }

    #[test]
    fn disabled_collector_does_not_block_transmission() {
        let pipeline = pipeline();
        pipeline.export_span(&server_span(""));
        assert!(pipeline.collector().get_and_restart().is_none());
        assert_eq!(pipeline.channel().buffered_count(), 1);
    }

    #[test]
    fn sample_rate_propagates_from_trace_state() {
        let pipeline = pipeline();
        pipeline.export_span(&server_span("ai_sampling=25"));
        // The envelope is buffered with the parsed rate; mapper-level tests
        // assert the value itself. Here the span must not be dropped.
        assert_eq!(pipeline.channel().buffered_count(), 1);
    }
}
