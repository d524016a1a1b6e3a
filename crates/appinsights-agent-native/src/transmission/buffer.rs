//! In-memory envelope buffering and batch building.
//!
//! The buffer is a bounded FIFO queue owned by the channel. Batches are cut
//! when either the item threshold is reached or the oldest queued envelope
//! has aged past the batch deadline. Unlike a lossy queue, a full buffer
//! rejects the new envelope back to the caller, which escalates it to the
//! spool.

use crate::telemetry::envelope::TelemetryItem;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct QueuedItem {
    item: TelemetryItem,
    enqueued_at: Instant,
}

pub(crate) struct TelemetryBuffer {
    queue: VecDeque<QueuedItem>,
    max_items: usize,
}

impl TelemetryBuffer {
    pub(crate) fn new(max_items: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_items,
        }
    }

    /// Queues an envelope, or hands it back when the buffer is at capacity.
    ///
    /// # Arguments
    ///
    /// * `item` - The envelope to queue
    /// * `now` - Enqueue timestamp used later for the age threshold
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Queued
    /// * `Err(item)` - At capacity; the caller escalates to the spool
    pub(crate) fn try_add(
        &mut self,
        item: TelemetryItem,
        now: Instant,
    ) -> Result<(), TelemetryItem> {
        if self.queue.len() >= self.max_items {
            return Err(item);
        }
        self.queue.push_back(QueuedItem {
            item,
            enqueued_at: now,
        });
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Cuts a batch when a threshold is met: `max_batch_items` queued, or
    /// the oldest envelope older than `max_age`.
    ///
    /// # Arguments
    ///
    /// * `now` - Current time the age threshold is evaluated against
    /// * `max_batch_items` - Batch size cap and the count threshold
    /// * `max_age` - Age of the oldest envelope that forces a batch out
    ///
    /// # Returns
    ///
    /// Up to `max_batch_items` envelopes in FIFO order, or an empty vector
    /// when neither threshold is met.
    pub(crate) fn cut_batch(
        &mut self,
        now: Instant,
        max_batch_items: usize,
        max_age: Duration,
    ) -> Vec<TelemetryItem> {
        let oldest_expired = self
            .queue
            .front()
            .is_some_and(|queued| now.duration_since(queued.enqueued_at) >= max_age);
        if self.queue.len() < max_batch_items && !oldest_expired {
            return Vec::new();
        }
        self.drain_batch(max_batch_items)
    }

    /// Cuts a batch unconditionally; used by flush and shutdown.
    pub(crate) fn force_batch(&mut self, max_batch_items: usize) -> Vec<TelemetryItem> {
        self.drain_batch(max_batch_items)
    }

    fn drain_batch(&mut self, max_batch_items: usize) -> Vec<TelemetryItem> {
        let take = self.queue.len().min(max_batch_items);
        self.queue
            .drain(..take)
            .map(|queued| queued.item)
            .collect()
    }
}
