//! Bounded blocking FIFO queue with backpressure
//!
//! [`BoundedQueue`] is the only mutable state shared between the streaming
//! producer and consumer. `put` waits while the queue is full and `get` waits
//! while it is empty; both wake exactly one waiter when they change the
//! queue. Waiters are served in FIFO order.
//!
//! The queue carries an explicit end-of-stream signal: after [`BoundedQueue::close`]
//! producers are refused, consumers drain what is buffered and then receive
//! `None`.

use crate::error::{Result, TrafficError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// Queue state guarded by the mutex
struct QueueState<T> {
    /// Buffered items, head is the next item returned by `get`
    buffer: VecDeque<T>,

    /// Set once by `close`
    closed: bool,

    /// Largest buffer length ever observed
    peak_len: usize,

    /// Items accepted by `put`
    enqueued: u64,

    /// Items returned by `get`
    dequeued: u64,
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    /// One permit per free slot
    slots: Semaphore,
    /// One permit per buffered item
    items: Semaphore,
    capacity: usize,
}

/// Fixed-capacity FIFO shared by producers and consumers
///
/// Cloning is cheap and yields another handle to the same queue.
pub struct BoundedQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TrafficError::ConfigError(
                "queue capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    buffer: VecDeque::with_capacity(capacity),
                    closed: false,
                    peak_len: 0,
                    enqueued: 0,
                    dequeued: 0,
                }),
                slots: Semaphore::new(capacity),
                items: Semaphore::new(0),
                capacity,
            }),
        })
    }

    /// Append an item at the tail, waiting while the queue is full.
    ///
    /// Fails with [`TrafficError::QueueClosed`] if the queue is closed before
    /// or while waiting for a free slot.
    pub async fn put(&self, item: T) -> Result<()> {
        let slot = self
            .inner
            .slots
            .acquire()
            .await
            .map_err(|_| TrafficError::QueueClosed)?;

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(TrafficError::QueueClosed);
        }
        slot.forget();
        state.buffer.push_back(item);
        state.enqueued += 1;
        state.peak_len = state.peak_len.max(state.buffer.len());
        drop(state);

        self.inner.items.add_permits(1);
        Ok(())
    }

    /// Remove and return the head item, waiting while the queue is empty.
    ///
    /// Returns `None` only once the queue is closed and fully drained.
    pub async fn get(&self) -> Option<T> {
        // A closed semaphore means end-of-stream: fall through and drain.
        let permit = self.inner.items.acquire().await.ok();

        // The permit is only consumed once the item is out of the buffer, so
        // a caller cancelled while waiting for the lock hands it back.
        let mut state = self.inner.state.lock().await;
        let item = state.buffer.pop_front()?;
        if let Some(permit) = permit {
            permit.forget();
        }
        state.dequeued += 1;
        drop(state);

        self.inner.slots.add_permits(1);
        Some(item)
    }

    /// Signal end-of-stream.
    ///
    /// Blocked producers fail with `QueueClosed`; blocked consumers wake and
    /// drain the remaining items. Closing twice is a no-op.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        self.inner.slots.close();
        self.inner.items.close();
        tracing::debug!("bounded queue closed");
    }

    /// Fixed capacity of the queue
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffered items
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.buffer.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Largest number of items ever buffered at once
    pub async fn peak_len(&self) -> usize {
        self.inner.state.lock().await.peak_len
    }

    /// Point-in-time view of the queue
    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        QueueStats {
            len: state.buffer.len(),
            capacity: self.inner.capacity,
            peak_len: state.peak_len,
            enqueued: state.enqueued,
            dequeued: state.dequeued,
            closed: state.closed,
        }
    }
}

/// Queue statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    pub peak_len: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub closed: bool,
}
