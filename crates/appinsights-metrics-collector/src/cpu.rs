//! Process CPU usage computed from successive scheduler-tick samples.
//!
//! A [`CpuSampler`] reads two monotonic counters: ticks consumed by this
//! process and ticks consumed by the whole machine. Usage over an interval is
//! the ratio of the two deltas, so the tracker has to retain the previous
//! sample between calls. The first call after construction only establishes
//! the baseline and reports `None`.

use std::sync::Mutex;

/// One reading of the process and machine scheduler-tick counters.
///
/// Both counters are cumulative since boot (machine) or process start
/// (process); only deltas between two samples are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    /// Ticks spent in user and system mode by this process.
    pub process_ticks: u64,
    /// Ticks spent by all CPUs in every state, including idle.
    pub total_ticks: u64,
}

/// Platform-specific source of [`CpuSample`] readings.
pub trait CpuSampler {
    /// Reads the current counters, or `None` when the source is unavailable.
    fn sample(&self) -> Option<CpuSample>;
}

/// Computes CPU usage percentages from consecutive sampler readings.
pub struct CpuUsageTracker {
    sampler: Box<dyn CpuSampler + Send + Sync>,
    last: Mutex<Option<CpuSample>>,
}

impl CpuUsageTracker {
    #[must_use]
    pub fn new(sampler: Box<dyn CpuSampler + Send + Sync>) -> Self {
        Self {
            sampler,
            last: Mutex::new(None),
        }
    }

    /// Returns the process CPU usage since the previous call, as a percentage
    /// of total machine capacity in `[0, 100]`.
    ///
    /// Returns `None` on the first call, when the platform sampler has no
    /// data, or when the machine counter did not advance between calls.
    pub fn usage_percent(&self) -> Option<f64> {
        let current = self.sampler.sample()?;
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = last.replace(current);
        let previous = previous?;

        let process_delta = current.process_ticks.checked_sub(previous.process_ticks)?;
        let total_delta = current.total_ticks.checked_sub(previous.total_ticks)?;
        if total_delta == 0 {
            return None;
        }

        let pct = 100.0 * process_delta as f64 / total_delta as f64;
        Some(pct.clamp(0.0, 100.0))
    }
}
