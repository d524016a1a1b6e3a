//! Concurrent counters behind the live metrics stream.
//!
//! Counts and total durations share one 64-bit word per telemetry kind:
//! count in the top 20 bits, milliseconds in the bottom 44. One atomic add
//! both increments the count and accumulates the duration, and one atomic
//! swap resets the interval. A single envelope whose duration exceeds the
//! 44-bit range encodes to zero, a bounded precision loss for that interval.
//!
//! Writers never exclude each other: `add` touches the counters through a
//! shared read guard and plain atomics. The snapshot's write-lock swap
//! drains in-flight readers first, which is what makes the interval exact:
//! an `add` that returned before the swap is in the finished interval, one
//! that returns after is in the next.

use crate::telemetry::envelope::{TelemetryData, TelemetryItem};
use crate::telemetry::time_format::duration_to_millis;
use appinsights_metrics_collector::cpu::CpuUsageTracker;
use appinsights_metrics_collector::memory::MemoryReader;
use appinsights_metrics_collector::{default_cpu_tracker, default_memory_reader};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Counts saturate at 20 bits.
const MAX_COUNT: u64 = (1 << 20) - 1;
/// Durations saturate at 44 bits of milliseconds.
const MAX_DURATION: u64 = (1 << 44) - 1;

/// Gauge value reported when a platform source is unavailable.
const UNAVAILABLE: f64 = -1.0;

pub(crate) fn encode_count_and_duration(count: u64, duration_ms: u64) -> u64 {
    if count > MAX_COUNT || duration_ms > MAX_DURATION {
        return 0;
    }
    (count << 44) | duration_ms
}

pub(crate) fn decode_count_and_duration(word: u64) -> (u64, u64) {
    (word >> 44, word & MAX_DURATION)
}

#[derive(Debug, Default)]
struct Counters {
    exceptions: AtomicU32,
    requests_and_durations: AtomicU64,
    unsuccessful_requests: AtomicU32,
    dependencies_and_durations: AtomicU64,
    unsuccessful_dependencies: AtomicU32,
}

/// One interval's worth of counters, read after the swap with no further
/// synchronization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalCounters {
    pub requests: u64,
    pub requests_duration_ms: u64,
    pub unsuccessful_requests: u32,
    pub dependencies: u64,
    pub dependencies_duration_ms: u64,
    pub unsuccessful_dependencies: u32,
    pub exceptions: u32,
    /// Process CPU usage percent, `-1` when unavailable.
    pub cpu_usage: f64,
    /// Committed memory bytes, `-1` when unavailable.
    pub memory_committed: f64,
}

/// Process-wide collector observing the envelope stream.
///
/// Disabled until the sender sees a subscriber; while disabled, `add` is a
/// single pointer load and nothing is recorded.
pub struct QuickPulseDataCollector {
    counters: RwLock<Option<Arc<Counters>>>,
    i_key: RwLock<Option<String>>,
    cpu: CpuUsageTracker,
    memory: Box<dyn MemoryReader + Send + Sync>,
}

impl Default for QuickPulseDataCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl QuickPulseDataCollector {
    /// Creates a disabled collector with the platform CPU and memory
    /// readers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(None),
            i_key: RwLock::new(None),
            cpu: default_cpu_tracker(),
            memory: default_memory_reader(),
        }
    }

    /// Starts counting envelopes whose tenant key equals `i_key`.
    ///
    /// Begins a fresh interval; any interval in progress is discarded.
    ///
    /// # Arguments
    ///
    /// * `i_key` - The tenant key envelopes must carry to be counted
    pub fn enable(&self, i_key: &str) {
        *write_guard(&self.i_key) = Some(i_key.to_string());
        *write_guard(&self.counters) = Some(Arc::new(Counters::default()));
    }

    /// Enables only when currently disabled, preserving an interval already
    /// in progress.
    pub fn ensure_enabled(&self, i_key: &str) {
        if read_guard(&self.counters).is_none() {
            self.enable(i_key);
        }
    }

    /// Stops counting and discards the current interval.
    pub fn disable(&self) {
        *write_guard(&self.counters) = None;
    }

    /// Whether an interval is currently being counted.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        read_guard(&self.counters).is_some()
    }

    /// Records one envelope into the current interval.
    ///
    /// Requests and dependencies contribute a count and their duration in
    /// milliseconds (plus the unsuccessful counter when `success` is
    /// false), exceptions contribute a count, messages and events are
    /// ignored. Envelopes carrying a different tenant key are ignored, as
    /// is everything while the collector is disabled.
    ///
    /// # Arguments
    ///
    /// * `item` - The envelope to observe; the collector never owns it
    pub fn add(&self, item: &TelemetryItem) {
        {
            let i_key = read_guard(&self.i_key);
            match i_key.as_deref() {
                Some(i_key) if i_key == item.i_key => {}
                _ => return,
            }
        }
        let guard = read_guard(&self.counters);
        let Some(counters) = guard.as_ref() else {
            return;
        };

        match item.base_data() {
            TelemetryData::Request(data) => {
                let duration_ms = duration_to_millis(&data.duration).unwrap_or(0);
                counters
                    .requests_and_durations
                    .fetch_add(encode_count_and_duration(1, duration_ms), Ordering::Relaxed);
                if !data.success {
                    counters.unsuccessful_requests.fetch_add(1, Ordering::Relaxed);
                }
            }
            TelemetryData::RemoteDependency(data) => {
                let duration_ms = duration_to_millis(&data.duration).unwrap_or(0);
                counters
                    .dependencies_and_durations
                    .fetch_add(encode_count_and_duration(1, duration_ms), Ordering::Relaxed);
                if !data.success {
                    counters
                        .unsuccessful_dependencies
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            TelemetryData::Exception(_) => {
                counters.exceptions.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryData::Message(_) | TelemetryData::Event(_) => {}
        }
    }

    /// Atomically swaps in a fresh interval and returns the finished one.
    ///
    /// # Returns
    ///
    /// * `Some(counters)` - The finished interval, decoded, together with
    ///   the current CPU and memory gauges
    /// * `None` - The collector is disabled
    pub fn get_and_restart(&self) -> Option<FinalCounters> {
        let swapped = {
            let mut counters = write_guard(&self.counters);
            counters.as_ref()?;
            counters.replace(Arc::new(Counters::default()))
        }?;
        Some(self.finish(&swapped))
    }

    /// Reads the current interval without resetting it.
    #[cfg(test)]
    pub(crate) fn peek(&self) -> Option<FinalCounters> {
        let counters = read_guard(&self.counters).clone()?;
        Some(self.finish(&counters))
    }

    fn finish(&self, counters: &Counters) -> FinalCounters {
        let (requests, requests_duration_ms) =
            decode_count_and_duration(counters.requests_and_durations.load(Ordering::Relaxed));
        let (dependencies, dependencies_duration_ms) =
            decode_count_and_duration(counters.dependencies_and_durations.load(Ordering::Relaxed));
        FinalCounters {
            requests,
            requests_duration_ms,
            unsuccessful_requests: counters.unsuccessful_requests.load(Ordering::Relaxed),
            dependencies,
            dependencies_duration_ms,
            unsuccessful_dependencies: counters.unsuccessful_dependencies.load(Ordering::Relaxed),
            exceptions: counters.exceptions.load(Ordering::Relaxed),
            cpu_usage: self.cpu.usage_percent().unwrap_or(UNAVAILABLE),
            memory_committed: self
                .memory
                .committed_bytes()
                .map_or(UNAVAILABLE, |bytes| bytes as f64),
        }
    }
}

fn read_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
