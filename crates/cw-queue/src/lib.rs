//! Transport-agnostic outbound work queue.
//!
//! A `MessageQueue` holds items in two lists, *pending* and *in-flight*, and
//! is driven entirely by `tick()`:
//! - Every pending item is dispatched in FIFO order; the dispatcher reports a
//!   synchronous failure by return value, or an asynchronous result later
//!   through [`MessageQueue::complete`] using the item's [`ItemId`].
//! - Items age out of the queue (pending or in-flight) after
//!   `max_enqueued_time_secs`, and a single attempt is cut off after
//!   `max_processing_time_secs`; either limit is disabled when zero.
//! - A failed attempt is retried from the head of the pending list until
//!   `max_retry_count` retries are spent; every item's completion callback
//!   fires exactly once, with the terminal result.
//!
//! The queue knows nothing about the network: items are owned here and
//! referred to by id, so the dispatcher and the completer never hold a
//! reference into the queue, and a completion can never re-enter a running
//! `tick()`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod error;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Result of one processing attempt, and the terminal result handed to an
/// item's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    Success,
    /// Attempt failed; retried while the item has retries left.
    Error,
    /// Processing was abandoned (teardown).
    Cancelled,
    /// The item aged out or an attempt exceeded its processing window.
    Timeout,
}

/// What the dispatcher did with the item it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The attempt was started; a result will arrive via `complete`.
    Dispatched,
    /// The attempt failed synchronously; counts like an `Error` completion.
    Failed,
}

/// Handle to a queued item. Stale ids (the item already completed or timed
/// out) are ignored by `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(u64);

/// Tunables, fixed at creation except where a setter exists. This struct is
/// the payload of the `retrieve_options`/`restore_options` round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Retries after the first attempt; zero means try once, never retry.
    pub max_retry_count: u32,
    /// Total seconds an item may spend queued (pending + in-flight); zero
    /// disables the check.
    pub max_enqueued_time_secs: u64,
    /// Seconds a single attempt may take; zero disables the check.
    pub max_processing_time_secs: u64,
    /// Upper bound on pending + in-flight items; zero means unbounded.
    pub max_queue_depth: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            max_enqueued_time_secs: 600,
            max_processing_time_secs: 0,
            max_queue_depth: 0,
        }
    }
}

/// Point-in-time item counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
}

type CompletionFn = Box<dyn FnOnce(ProcessingResult)>;

struct Item<M> {
    id: ItemId,
    message: M,
    on_done: Option<CompletionFn>,
    enqueued_at: Instant,
    dispatched_at: Option<Instant>,
    attempts: u32,
}

pub struct MessageQueue<M> {
    options: QueueOptions,
    next_id: u64,
    pending: VecDeque<Item<M>>,
    in_flight: VecDeque<Item<M>>,
}

impl<M> MessageQueue<M> {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            next_id: 0,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Append an item to the pending list. `on_done` fires exactly once with
    /// the item's terminal result.
    pub fn enqueue(
        &mut self,
        message: M,
        now: Instant,
        on_done: impl FnOnce(ProcessingResult) + 'static,
    ) -> Result<ItemId> {
        let depth = self.options.max_queue_depth;
        if depth > 0 && self.len() >= depth {
            return Err(QueueError::Full);
        }
        let id = ItemId(self.next_id);
        self.next_id += 1;
        self.pending.push_back(Item {
            id,
            message,
            on_done: Some(Box::new(on_done)),
            enqueued_at: now,
            dispatched_at: None,
            attempts: 0,
        });
        Ok(id)
    }

    /// One cooperative turn: expire aged items, then dispatch every pending
    /// item in FIFO order.
    ///
    /// `dispatch` is handed the item id and a shared view of the message; it
    /// must not assume the message outlives the call (retries hand out the
    /// same message again). Synchronously failed attempts that still have
    /// retries left go back to the head of the pending list and are tried
    /// again on the next tick.
    pub fn tick(&mut self, now: Instant, dispatch: &mut dyn FnMut(ItemId, &M) -> Dispatch) {
        self.expire(now);

        let mut requeue = Vec::new();
        while let Some(mut item) = self.pending.pop_front() {
            item.dispatched_at = Some(now);
            match dispatch(item.id, &item.message) {
                Dispatch::Dispatched => self.in_flight.push_back(item),
                Dispatch::Failed => {
                    if item.attempts < self.options.max_retry_count {
                        item.attempts += 1;
                        item.dispatched_at = None;
                        debug!(
                            item = item.id.0,
                            attempts = item.attempts,
                            "attempt failed, requeueing at head"
                        );
                        requeue.push(item);
                    } else {
                        Self::finish(item, ProcessingResult::Error);
                    }
                }
            }
        }
        for item in requeue.into_iter().rev() {
            self.pending.push_front(item);
        }
    }

    /// Report the asynchronous result of an attempt started by `tick`.
    ///
    /// Returns false when the id is unknown — the item already reached a
    /// terminal result (typically a timeout) and the late result is dropped.
    pub fn complete(&mut self, id: ItemId, result: ProcessingResult) -> bool {
        let Some(pos) = self.in_flight.iter().position(|item| item.id == id) else {
            debug!(item = id.0, result = ?result, "ignoring completion for unknown item");
            return false;
        };
        let Some(mut item) = self.in_flight.remove(pos) else {
            return false;
        };
        item.dispatched_at = None;
        match result {
            ProcessingResult::Error => self.retry_or_finish(item),
            terminal => Self::finish(item, terminal),
        }
        true
    }

    /// True iff both lists are empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Total items held, pending plus in-flight.
    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
        }
    }

    /// Return every in-flight item to the head of the pending list, keeping
    /// the original FIFO order. Used on stop; no completions fire.
    pub fn move_all_in_flight_back_to_pending(&mut self) {
        while let Some(mut item) = self.in_flight.pop_back() {
            item.dispatched_at = None;
            self.pending.push_front(item);
        }
    }

    /// Drain both lists, completing every item with `result`. Used on
    /// teardown.
    pub fn fail_all(&mut self, result: ProcessingResult) {
        if !self.is_empty() {
            warn!(
                pending = self.pending.len(),
                in_flight = self.in_flight.len(),
                result = ?result,
                "failing all queued items"
            );
        }
        while let Some(item) = self.in_flight.pop_front() {
            Self::finish(item, result);
        }
        while let Some(item) = self.pending.pop_front() {
            Self::finish(item, result);
        }
    }

    pub fn set_max_enqueued_time(&mut self, secs: u64) {
        self.options.max_enqueued_time_secs = secs;
    }

    /// Snapshot the tunables as an opaque blob for persistence.
    pub fn retrieve_options(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.options)?)
    }

    /// Restore tunables from a `retrieve_options` blob.
    pub fn restore_options(&mut self, blob: &serde_json::Value) -> Result<()> {
        self.options = serde_json::from_value(blob.clone())?;
        Ok(())
    }

    fn expire(&mut self, now: Instant) {
        if self.options.max_enqueued_time_secs > 0 {
            let ttl = Duration::from_secs(self.options.max_enqueued_time_secs);
            // In-flight items are the oldest; complete them first so timeout
            // callbacks fire in FIFO order.
            Self::expire_list(&mut self.in_flight, |item| {
                now.duration_since(item.enqueued_at) >= ttl
            });
            Self::expire_list(&mut self.pending, |item| {
                now.duration_since(item.enqueued_at) >= ttl
            });
        }
        if self.options.max_processing_time_secs > 0 {
            let window = Duration::from_secs(self.options.max_processing_time_secs);
            Self::expire_list(&mut self.in_flight, |item| {
                item.dispatched_at
                    .is_some_and(|at| now.duration_since(at) >= window)
            });
        }
    }

    fn expire_list(list: &mut VecDeque<Item<M>>, mut expired: impl FnMut(&Item<M>) -> bool) {
        let mut index = 0;
        while index < list.len() {
            if expired(&list[index]) {
                if let Some(item) = list.remove(index) {
                    debug!(item = item.id.0, attempts = item.attempts, "item timed out");
                    Self::finish(item, ProcessingResult::Timeout);
                }
            } else {
                index += 1;
            }
        }
    }

    fn retry_or_finish(&mut self, mut item: Item<M>) {
        if item.attempts < self.options.max_retry_count {
            item.attempts += 1;
            item.dispatched_at = None;
            debug!(
                item = item.id.0,
                attempts = item.attempts,
                max_retries = self.options.max_retry_count,
                "attempt failed, requeueing at head"
            );
            self.pending.push_front(item);
        } else {
            Self::finish(item, ProcessingResult::Error);
        }
    }

    fn finish(mut item: Item<M>, result: ProcessingResult) {
        if let Some(on_done) = item.on_done.take() {
            on_done(result);
        }
    }
}
