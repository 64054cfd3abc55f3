//! Bounded FIFO work queue
//!
//! Decouples submission from execution with fixed buffering. Enqueue is
//! non-blocking and fails fast when the buffer is at capacity - that
//! rejection is the engine's backpressure signal, so callers see a full
//! queue instead of an unbounded hidden buffer. Dequeue blocks until an
//! item is available or the queue is closed and drained.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Enqueue rejection reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The queue is at capacity; the caller should slow down or shed load
    #[error("work queue is full")]
    Full,

    /// The queue has been closed; no further work is accepted
    #[error("work queue is closed")]
    Closed,
}

struct QueueInner<I> {
    items: VecDeque<I>,
    closed: bool,
}

/// Fixed-capacity FIFO buffer connecting producers to workers
pub struct BoundedQueue<I> {
    inner: Mutex<QueueInner<I>>,
    notify: Notify,
    capacity: usize,
}

impl<I> BoundedQueue<I> {
    /// Create a queue with the given fixed capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append an item without blocking
    ///
    /// Fails with [`EnqueueError::Full`] at capacity and
    /// [`EnqueueError::Closed`] after [`close`](Self::close).
    pub fn try_enqueue(&self, item: I) -> Result<(), EnqueueError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(EnqueueError::Closed);
            }
            if inner.items.len() >= self.capacity {
                return Err(EnqueueError::Full);
            }
            inner.items.push_back(item);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Remove the oldest item, waiting until one is available
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn dequeue(&self) -> Option<I> {
        loop {
            // Register for wakeups before checking so a concurrent
            // enqueue or close between the check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting enqueues; pending dequeues drain the remainder
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            debug!(remaining = inner.items.len(), "work queue closed");
        }
        self.notify.notify_waiters();
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Fixed capacity set at construction
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drain all remaining items without waiting
    pub fn drain(&self) -> Vec<I> {
        let mut inner = self.inner.lock();
        inner.items.drain(..).collect()
    }
}
