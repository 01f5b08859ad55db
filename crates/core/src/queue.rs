//! Capture → delivery hand-off.
//!
//! The capture thread never calls into delivery code. It posts units to a
//! [`FrameSink`]; the delivery side drains a [`FrameQueue`] on its own loop.
//!
//! ```text
//! capture thread ──post_frame──► [ VecDeque (capped) ] ──pop/wait_pop──► delivery loop
//!                                  drop-oldest when full
//! ```
//!
//! Enqueue and dequeue are the only critical sections. Consumers blocked in
//! [`FrameQueue::wait_pop`] are woken on the empty → non-empty edge only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

/// Default queue depth in units.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Accepts byte buffers for later network delivery.
pub trait FrameSink: Send + Sync {
    /// Enqueue one unit. Must not block on the consumer.
    fn post_frame(&self, data: Bytes, timestamp: Duration);
}

/// One queued delivery unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFrame {
    pub data: Bytes,
    /// Capture time relative to the start of the session.
    pub timestamp: Duration,
}

/// Bounded drop-oldest queue with a wake-up edge.
pub struct FrameQueue {
    frames: Mutex<VecDeque<QueuedFrame>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    posted: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
            posted: AtomicU64::new(0),
        }
    }

    /// Enqueue, evicting the oldest entry when full.
    pub fn push(&self, frame: QueuedFrame) {
        let (was_empty, evicted) = {
            let mut frames = self.frames.lock();
            let was_empty = frames.is_empty();
            let evicted = if frames.len() >= self.capacity {
                frames.pop_front()
            } else {
                None
            };
            frames.push_back(frame);
            (was_empty, evicted.is_some())
        };

        self.posted.fetch_add(1, Ordering::Relaxed);
        if evicted {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(dropped, capacity = self.capacity, "queue full, dropped oldest");
        }
        if was_empty {
            self.ready.notify_one();
        }
    }

    /// Dequeue without waiting.
    pub fn pop(&self) -> Option<QueuedFrame> {
        self.frames.lock().pop_front()
    }

    /// Dequeue, waiting up to `timeout` for a unit to arrive.
    pub fn wait_pop(&self, timeout: Duration) -> Option<QueuedFrame> {
        let mut frames = self.frames.lock();
        if frames.is_empty() {
            // spurious wake-ups fall through to an empty pop
            self.ready.wait_for(&mut frames, timeout);
        }
        frames.pop_front()
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> Vec<QueuedFrame> {
        self.frames.lock().drain(..).collect()
    }

    /// Wake all waiting consumers, e.g. on shutdown.
    pub fn wake_all(&self) {
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Units evicted by drop-oldest since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Units posted since creation, dropped ones included.
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl FrameSink for FrameQueue {
    fn post_frame(&self, data: Bytes, timestamp: Duration) {
        self.push(QueuedFrame { data, timestamp });
    }
}
