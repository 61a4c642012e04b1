//! Bounded single-consumer queues for the media pipeline
//!
//! Every stage boundary in the pipeline (packets, decoded frames, synced
//! composites) uses a [`BoundedQueue`]. When a producer outruns its consumer
//! the oldest entry is dropped so the consumer always advances toward the
//! most recent data. Dropped counts are exposed for the stats endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A bounded FIFO that drops its oldest entry on overflow.
///
/// Designed for exactly one consumer task per queue. Producers may be many.
/// The lock is never held across an `.await`.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an entry, evicting the oldest one if the queue is full.
    ///
    /// Entries pushed after [`close`](Self::close) are discarded.
    pub fn push(&self, item: T) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Take the oldest entry without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Take the oldest entry, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.items.lock().pop_front();
            }
            self.notify.notified().await;
        }
    }

    /// Take the newest entry, waiting until at least one is available.
    ///
    /// Everything older than the returned entry is discarded and counted
    /// as dropped. Used when the consumer prefers freshness over
    /// completeness.
    pub async fn pop_latest(&self) -> Option<T> {
        loop {
            {
                let mut items = self.items.lock();
                if let Some(newest) = items.pop_back() {
                    let skipped = items.len() as u64;
                    if skipped > 0 {
                        items.clear();
                        self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    }
                    return Some(newest);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue. Pending entries stay poppable; once drained,
    /// `pop` returns `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        // Covers a consumer that checked `closed` just before we stored it
        // and has not yet registered as a waiter.
        self.notify.notify_one();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current number of queued entries.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Maximum number of entries the queue holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries evicted by overflow or skipped by `pop_latest`.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .field("dropped", &self.dropped())
            .finish()
    }
}
