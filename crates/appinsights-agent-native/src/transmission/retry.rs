//! Delivery outcome classification and the global backoff policy.
//!
//! One policy instance gates all outbound transmissions: after a transient
//! failure every sender waits out the same backoff window, while envelopes
//! keep accumulating upstream. Backoff grows exponentially with the number
//! of consecutive failures, jittered to half-to-full of the nominal value,
//! and collapses on the first success.

use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Classification of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    /// 2xx accepted; the batch is acknowledged.
    Accepted,
    /// Worth retrying: request timeout, server error, unavailable, or no
    /// response at all.
    Transient(String),
    /// The service rejected the batch; retrying cannot help.
    Permanent(u16),
}

/// Maps an HTTP status to a delivery outcome.
///
/// # Arguments
///
/// * `status` - The response status code
///
/// # Returns
///
/// `Accepted` for 200/206, `Transient` for 408/500/503, `Permanent` for
/// everything else.
pub(crate) fn classify_status(status: u16) -> DeliveryOutcome {
    match status {
        200 | 206 => DeliveryOutcome::Accepted,
        408 | 500 | 503 => DeliveryOutcome::Transient(format!("status {status}")),
        other => DeliveryOutcome::Permanent(other),
    }
}

/// Global transmission gate shared by workers, flush, and the spool
/// drainer.
pub(crate) struct TransmissionPolicy {
    base: Duration,
    max: Duration,
    consecutive_failures: AtomicU32,
    paused_until: Mutex<Option<Instant>>,
}

impl TransmissionPolicy {
    /// Creates a healthy policy.
    ///
    /// # Arguments
    ///
    /// * `base_ms` - Backoff after the first failure, in milliseconds
    /// * `max_ms` - Backoff ceiling, in milliseconds
    pub(crate) fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms.max(1)),
            max: Duration::from_millis(max_ms.max(1)),
            consecutive_failures: AtomicU32::new(0),
            paused_until: Mutex::new(None),
        }
    }

    /// Records a transient failure and pauses all transmissions for the
    /// backoff interval.
    ///
    /// # Returns
    ///
    /// The pause duration, doubled per consecutive failure up to the
    /// ceiling and jittered; an already-longer pause is kept.
    pub(crate) fn record_failure(&self) -> Duration {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let backoff = self.backoff_for(failures);
        let until = Instant::now() + backoff;
        let mut paused = lock(&self.paused_until);
        match *paused {
            Some(existing) if existing >= until => {}
            _ => *paused = Some(until),
        }
        backoff
    }

    /// Clears the pause and the failure streak.
    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *lock(&self.paused_until) = None;
    }

    /// True when transmissions are not paused; the spool drainer only runs
    /// while healthy.
    pub(crate) fn is_healthy(&self) -> bool {
        match *lock(&self.paused_until) {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Waits out the active pause, honoring cancellation.
    ///
    /// # Arguments
    ///
    /// * `cancel` - Cancellation observed while sleeping
    ///
    /// # Returns
    ///
    /// `true` once transmissions may proceed, `false` when cancelled
    /// first.
    pub(crate) async fn wait_until_ready(&self, cancel: &CancellationToken) -> bool {
        loop {
            let until = *lock(&self.paused_until);
            let Some(until) = until else {
                return true;
            };
            if Instant::now() >= until {
                return true;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep_until(until) => {}
            }
        }
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let nominal = self
            .base
            .saturating_mul(1_u32 << exponent)
            .min(self.max);
        // jitter to [0.5, 1.0] of nominal so concurrent agents spread out
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        nominal.mul_f64(factor)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
