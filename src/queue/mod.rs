//! A FIFO of outbound work items with per-item timeouts, a bounded retry
//! count, and a bulk "move in-flight back to pending" operation used on
//! reconnect.
//!
//! [`MessageQueue`] is a cheap, `Clone`-able handle around shared interior
//! state (`Rc<RefCell<..>>`) rather than an owned collection. That shape is
//! what lets the `on_process_message` callback passed to [`MessageQueue::do_work`]
//! stash a clone of the queue and report a completion later, once the
//! underlying AMQP send actually finishes, all single threaded and
//! cooperative with no internal suspension points.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Terminal outcome of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    Success,
    Error,
    Timeout,
    Cancelled,
}

/// Configuration for a [`MessageQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How many times an item may be moved from in-progress back to pending
    /// (via [`MessageQueue::move_all_back_to_pending`]) before it is given up
    /// on with [`QueueResult::Error`]. `0` means unlimited, matching the
    /// source's `DEFAULT_EVENT_SEND_RETRY_LIMIT = 0`.
    pub max_retry_count: u32,
    /// Items still pending after this long are completed with
    /// [`QueueResult::Timeout`] instead of being dispatched.
    pub max_message_enqueued_time: Duration,
    /// Items still in-progress after this long are completed with
    /// [`QueueResult::Timeout`]. `Duration::ZERO` disables this check.
    pub max_message_processing_time: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_retry_count: 0,
            max_message_enqueued_time: Duration::from_secs(600),
            max_message_processing_time: Duration::ZERO,
        }
    }
}

/// A snapshot of the subset of [`QueueConfig`] that is worth replaying across
/// a reconnect (the enqueue-time bound and the retry count). This is this
/// crate's answer to the source's `OPTIONHANDLER`-based reload of message
/// queue options.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptionsSnapshot {
    pub max_message_enqueued_time: Duration,
    pub max_retry_count: u32,
}

struct Entry<T> {
    id: u64,
    item: T,
    enqueued_at: Instant,
    processing_started_at: Option<Instant>,
    retry_count: u32,
    on_completed: Box<dyn FnOnce(T, QueueResult)>,
}

struct Inner<T> {
    config: QueueConfig,
    pending: VecDeque<Entry<T>>,
    in_progress: Vec<Entry<T>>,
    next_id: u64,
}

/// A cheap, cloneable handle to a shared outbound queue.
///
/// All clones refer to the same underlying storage; this is the mechanism by
/// which [`MessageQueue::do_work`]'s process callback can report a
/// completion asynchronously, after the call to `do_work` that dispatched the
/// item has already returned.
pub struct MessageQueue<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        MessageQueue {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> MessageQueue<T> {
    pub fn create(config: QueueConfig) -> Self {
        MessageQueue {
            inner: Rc::new(RefCell::new(Inner {
                config,
                pending: VecDeque::new(),
                in_progress: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Append `item` to the pending list. `on_completed` fires exactly once,
    /// whenever the item reaches a terminal [`QueueResult`].
    pub fn add(&self, item: T, on_completed: impl FnOnce(T, QueueResult) + 'static) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push_back(Entry {
            id,
            item,
            enqueued_at: Instant::now(),
            processing_started_at: None,
            retry_count: 0,
            on_completed: Box::new(on_completed),
        });
        id
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.borrow();
        inner.pending.is_empty() && inner.in_progress.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    pub fn in_progress_count(&self) -> usize {
        self.inner.borrow().in_progress.len()
    }

    /// Drain all in-progress items back to the head of pending, preserving
    /// their relative order, and reset their processing clock. Used on
    /// messenger stop so a reconnect resends everything that was mid-flight.
    pub fn move_all_back_to_pending(&self) {
        let mut inner = self.inner.borrow_mut();
        let mut completions = Vec::new();
        let drained: Vec<Entry<T>> = inner.in_progress.drain(..).collect();
        for mut entry in drained.into_iter().rev() {
            entry.processing_started_at = None;
            entry.retry_count += 1;
            let max_retry = inner.config.max_retry_count;
            if max_retry != 0 && entry.retry_count > max_retry {
                completions.push(entry);
            } else {
                inner.pending.push_front(entry);
            }
        }
        drop(inner);
        for entry in completions {
            (entry.on_completed)(entry.item, QueueResult::Error);
        }
    }

    pub fn set_max_message_enqueued_time_secs(&self, secs: u64) {
        self.inner.borrow_mut().config.max_message_enqueued_time = Duration::from_secs(secs);
    }

    pub fn retrieve_options(&self) -> QueueOptionsSnapshot {
        let inner = self.inner.borrow();
        QueueOptionsSnapshot {
            max_message_enqueued_time: inner.config.max_message_enqueued_time,
            max_retry_count: inner.config.max_retry_count,
        }
    }

    /// Report that the item identified by `id` (handed to the process
    /// callback by [`MessageQueue::do_work`]) has reached a terminal state.
    /// A no-op if `id` is unknown (already completed, or never existed),
    /// so callers don't need to track whether they already completed an
    /// item themselves.
    pub fn complete(&self, id: u64, result: QueueResult) {
        let entry = {
            let mut inner = self.inner.borrow_mut();
            let pos = inner.in_progress.iter().position(|e| e.id == id);
            pos.map(|pos| inner.in_progress.remove(pos))
        };
        if let Some(entry) = entry {
            (entry.on_completed)(entry.item, result);
        }
    }

    /// Move pending items whose age is still within the enqueue-time bound
    /// into in-progress and hand each to `on_process_message`; complete
    /// pending items that have aged out with [`QueueResult::Timeout`] without
    /// dispatching them; complete in-progress items whose processing age
    /// exceeds the (nonzero) processing-time bound with
    /// [`QueueResult::Timeout`].
    ///
    /// `on_process_message` receives a clone of the item, its id (to pass
    /// back to [`MessageQueue::complete`]) and a clone of this queue handle
    /// so it can report completion whenever the underlying send actually
    /// finishes, including synchronously, from within the callback itself.
    pub fn do_work(&self, mut on_process_message: impl FnMut(T, u64, MessageQueue<T>))
    where
        T: Clone,
    {
        let now = Instant::now();

        let (ready, aged_out) = {
            let mut inner = self.inner.borrow_mut();
            let max_enqueued = inner.config.max_message_enqueued_time;
            let mut ready = Vec::new();
            let mut aged_out = Vec::new();
            while let Some(entry) = inner.pending.pop_front() {
                if now.saturating_duration_since(entry.enqueued_at) < max_enqueued {
                    ready.push(entry);
                } else {
                    aged_out.push(entry);
                }
            }
            (ready, aged_out)
        };

        for entry in aged_out {
            (entry.on_completed)(entry.item, QueueResult::Timeout);
        }

        // The entry is pushed into `in_progress` *before* the callback runs
        // so that a synchronous `handle.complete(id, ..)` call from inside
        // the callback finds it there, without re-entering the RefCell
        // borrow the push itself took.
        for mut entry in ready {
            entry.processing_started_at = Some(now);
            let id = entry.id;
            let item_for_callback = entry.item.clone();
            self.inner.borrow_mut().in_progress.push(entry);
            on_process_message(item_for_callback, id, self.clone());
        }

        let timed_out = {
            let mut inner = self.inner.borrow_mut();
            let max_processing = inner.config.max_message_processing_time;
            if max_processing.is_zero() {
                Vec::new()
            } else {
                let mut timed_out = Vec::new();
                let mut i = 0;
                while i < inner.in_progress.len() {
                    let started = inner.in_progress[i].processing_started_at.unwrap_or(now);
                    if now.saturating_duration_since(started) > max_processing {
                        timed_out.push(inner.in_progress.remove(i));
                    } else {
                        i += 1;
                    }
                }
                timed_out
            }
        };
        for entry in timed_out {
            (entry.on_completed)(entry.item, QueueResult::Timeout);
        }
    }

    /// Complete every remaining item, pending or in-progress, with
    /// [`QueueResult::Cancelled`]. Intended for use right before the queue is
    /// dropped.
    pub fn cancel_all(&self) {
        let (pending, in_progress) = {
            let mut inner = self.inner.borrow_mut();
            (
                inner.pending.drain(..).collect::<Vec<_>>(),
                inner.in_progress.drain(..).collect::<Vec<_>>(),
            )
        };
        for entry in pending.into_iter().chain(in_progress) {
            (entry.on_completed)(entry.item, QueueResult::Cancelled);
        }
    }
}
