//! Shutdownable bounded FIFO for outbound stream elements.
//!
//! The connection owns one [`ShutdownableQueue`] buffering elements between
//! application tasks and the single writer task. Unlike a plain channel it
//! has explicit shutdown/restart control: `shutdown()` wakes every
//! suspended putter and taker and makes them fail rather than hang, and
//! `start()` re-enables the queue for reconnection.
//!
//! All waits re-check state under the lock after every wake, so spurious
//! or stale notifications never produce a lost element or a stuck waiter.
//! Cancelling a wait (dropping the future) leaves the queue consistent:
//! the element is only inserted inside the critical section.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Default capacity of the outbound element queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// The queue was shut down while the operation was waiting, or before it
/// began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue is shut down")]
pub struct ShutDown;

/// Outcome of a best-effort, never-waiting insert.
#[derive(Debug)]
pub enum TryPut<T> {
    /// The element was inserted.
    Accepted,
    /// The queue lock was held elsewhere; the element is handed back.
    Busy(T),
    /// The queue is shut down; the element is handed back.
    ShutDown(T),
    /// The queue is full; the element is handed back.
    Full(T),
}

/// Outcome of a best-effort, never-waiting removal.
#[derive(Debug)]
pub enum TryTake<T> {
    /// An element was removed.
    Taken(T),
    /// The queue lock was held elsewhere.
    Busy,
    /// The queue is shut down and empty.
    ShutDown,
    /// The queue is empty.
    Empty,
}

#[derive(Debug)]
struct Inner<T> {
    buffer: VecDeque<T>,
    shutdown: bool,
}

/// A bounded FIFO with explicit shutdown/restart control.
#[derive(Debug)]
pub struct ShutdownableQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> ShutdownableQueue<T> {
    /// Create a queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Insert an element, suspending until space is available.
    ///
    /// Fails if the queue is shut down, or becomes shut down while this
    /// call is suspended. The element is dropped on failure, never
    /// silently inserted.
    pub async fn put(&self, element: T) -> Result<(), ShutDown> {
        let mut element = Some(element);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.shutdown {
                    return Err(ShutDown);
                }
                if inner.buffer.len() < self.capacity {
                    if let Some(element) = element.take() {
                        inner.buffer.push_back(element);
                    }
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Insert every element of `elements` in order.
    ///
    /// Inserts as many elements per lock acquisition as capacity allows
    /// and signals not-empty once per critical section rather than per
    /// element. If the queue is shut down mid-batch, elements inserted so
    /// far remain queued and the rest are dropped.
    pub async fn put_all<I>(&self, elements: I) -> Result<(), ShutDown>
    where
        I: IntoIterator<Item = T>,
    {
        let mut pending: VecDeque<T> = elements.into_iter().collect();
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let inserted = {
                let mut inner = self.lock();
                if inner.shutdown {
                    return Err(ShutDown);
                }
                let mut inserted = 0;
                while inner.buffer.len() < self.capacity {
                    match pending.pop_front() {
                        Some(element) => {
                            inner.buffer.push_back(element);
                            inserted += 1;
                        }
                        None => break,
                    }
                }
                inserted
            };
            if inserted > 0 {
                self.not_empty.notify_waiters();
            }
            if pending.is_empty() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Insert without waiting. Returns `false` on a full or shut-down
    /// queue rather than failing the caller.
    pub fn offer(&self, element: T) -> bool {
        let mut inner = self.lock();
        if inner.shutdown || inner.buffer.len() >= self.capacity {
            return false;
        }
        inner.buffer.push_back(element);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Insert, waiting at most `timeout` for space. Returns `false` on
    /// expiry or shutdown rather than failing the caller.
    pub async fn offer_timeout(&self, element: T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut element = Some(element);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.shutdown {
                    return false;
                }
                if inner.buffer.len() < self.capacity {
                    if let Some(element) = element.take() {
                        inner.buffer.push_back(element);
                    }
                    drop(inner);
                    self.not_empty.notify_one();
                    return true;
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Insert without ever waiting, not even on the queue lock.
    ///
    /// For callers that must never stall, such as code already holding an
    /// unrelated lock. The unconsumed element is handed back in every
    /// non-accepted outcome.
    pub fn try_put(&self, element: T) -> TryPut<T> {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return TryPut::Busy(element),
        };
        if inner.shutdown {
            return TryPut::ShutDown(element);
        }
        if inner.buffer.len() >= self.capacity {
            return TryPut::Full(element);
        }
        inner.buffer.push_back(element);
        drop(inner);
        self.not_empty.notify_one();
        TryPut::Accepted
    }

    /// Remove the oldest element, suspending until one is available.
    ///
    /// Buffered elements are still delivered after shutdown; the call
    /// fails only once the queue is both shut down and empty.
    pub async fn take(&self) -> Result<T, ShutDown> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(element) = inner.buffer.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Ok(element);
                }
                if inner.shutdown {
                    return Err(ShutDown);
                }
            }
            notified.await;
        }
    }

    /// Remove without ever waiting, not even on the queue lock.
    pub fn try_take(&self) -> TryTake<T> {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return TryTake::Busy,
        };
        if let Some(element) = inner.buffer.pop_front() {
            drop(inner);
            self.not_full.notify_one();
            return TryTake::Taken(element);
        }
        if inner.shutdown {
            return TryTake::ShutDown;
        }
        TryTake::Empty
    }

    /// Remove the oldest element, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` on expiry; fails if the queue is shut down and
    /// empty.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<T>, ShutDown> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(element) = inner.buffer.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Ok(Some(element));
                }
                if inner.shutdown {
                    return Err(ShutDown);
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Move up to `max` buffered elements (all of them when `None`) into
    /// `sink` and return how many were moved. Never waits.
    pub fn drain_to(&self, sink: &mut Vec<T>, max: Option<usize>) -> usize {
        let drained = {
            let mut inner = self.lock();
            let limit = max.unwrap_or(usize::MAX).min(inner.buffer.len());
            sink.extend(inner.buffer.drain(..limit));
            limit
        };
        if drained > 0 {
            self.not_full.notify_waiters();
        }
        drained
    }

    /// Shut the queue down, waking every suspended putter and taker.
    ///
    /// Subsequent suspending operations fail immediately until
    /// [`start`](Self::start) is called. Buffered elements remain
    /// takeable.
    pub fn shutdown(&self) {
        {
            let mut inner = self.lock();
            inner.shutdown = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Clear the shutdown flag, re-enabling suspending operations.
    pub fn start(&self) {
        let mut inner = self.lock();
        inner.shutdown = false;
    }

    /// Atomically attempt one [`offer`](Self::offer) and then shut down.
    ///
    /// Used for "send one last element then stop accepting more"
    /// termination sequences. Returns whether the element was inserted;
    /// fails if the queue was already shut down (and still leaves it shut
    /// down).
    pub fn offer_and_shutdown(&self, element: T) -> Result<bool, ShutDown> {
        let result = {
            let mut inner = self.lock();
            if inner.shutdown {
                Err(ShutDown)
            } else {
                let inserted = if inner.buffer.len() < self.capacity {
                    inner.buffer.push_back(element);
                    true
                } else {
                    false
                };
                inner.shutdown = true;
                Ok(inserted)
            }
        };
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        result
    }

    /// Number of buffered elements.
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    /// The fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the queue is currently shut down.
    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // The lock is only held for short, non-panicking critical
        // sections; recover the guard if a test assertion ever poisons it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
