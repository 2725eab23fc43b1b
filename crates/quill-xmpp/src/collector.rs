//! Request/response correlation collectors.
//!
//! A [`StanzaCollector`] pairs a filter with a bounded result ring. It is
//! registered in the connection's live-collector registry before its
//! constructor returns, so a reply arriving immediately after a send can
//! never be missed. The dispatch task pushes matching stanzas in; the
//! owning task awaits them out. A collector is ACTIVE from construction
//! until [`cancel`](StanzaCollector::cancel), which is idempotent, safe
//! against an in-flight delivery, and also wired into `Drop` so a
//! registration can never leak.
//!
//! The result ring never blocks dispatch: when full, the oldest buffered
//! result is evicted so a slow consumer observes the newest replies.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::connection::ConnectionInner;
use crate::error::Error;
use crate::filter::StanzaFilter;
use crate::stanza::{Stanza, StanzaError, StanzaErrorCondition, StanzaErrorType};

/// Default result-ring capacity: one slot, sized for single-shot
/// request/response use. Streaming consumers pass a larger capacity.
pub const DEFAULT_COLLECTOR_CAPACITY: usize = 1;

/// Registry-side collector state, shared between the dispatch task and
/// the owning [`StanzaCollector`] handle.
pub(crate) struct CollectorShared {
    filter: Arc<dyn StanzaFilter>,
    capacity: usize,
    buffer: Mutex<VecDeque<Stanza>>,
    cancelled: AtomicBool,
    notify: Notify,
}

impl CollectorShared {
    pub(crate) fn new(filter: Arc<dyn StanzaFilter>, capacity: usize) -> Self {
        assert!(capacity >= 1, "collector capacity must be at least 1");
        Self {
            filter,
            capacity,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Offer a stanza from the dispatch task. Never blocks: a full ring
    /// evicts its oldest entry.
    pub(crate) fn deliver(&self, stanza: &Stanza) {
        if self.cancelled.load(Ordering::Acquire) || !self.filter.accept(stanza) {
            return;
        }
        {
            let mut buffer = self.lock();
            if buffer.len() == self.capacity {
                buffer.pop_front();
                trace!(filter = ?self.filter, "collector ring full; evicted oldest result");
            }
            buffer.push_back(stanza.clone());
        }
        self.notify.notify_waiters();
    }

    /// Mark cancelled and wake every waiter. Idempotent; returns whether
    /// this call performed the transition.
    pub(crate) fn cancel(&self) -> bool {
        let transitioned = !self.cancelled.swap(true, Ordering::AcqRel);
        if transitioned {
            self.notify.notify_waiters();
        }
        transitioned
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn pop(&self) -> Option<Stanza> {
        self.lock().pop_front()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Stanza>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A registered filter plus bounded result buffer; the owning task awaits
/// results until a match arrives, a deadline elapses, or the collector is
/// cancelled.
pub struct StanzaCollector {
    id: u64,
    shared: Arc<CollectorShared>,
    connection: Arc<ConnectionInner>,
    request: Option<Stanza>,
}

impl StanzaCollector {
    pub(crate) fn new(
        id: u64,
        shared: Arc<CollectorShared>,
        connection: Arc<ConnectionInner>,
        request: Option<Stanza>,
    ) -> Self {
        Self {
            id,
            shared,
            connection,
            request,
        }
    }

    /// The request this collector was created for, when recorded.
    pub fn request(&self) -> Option<&Stanza> {
        self.request.as_ref()
    }

    /// Remove the next buffered match without waiting.
    pub fn poll_result(&self) -> Option<Stanza> {
        self.shared.pop()
    }

    /// Await the next match indefinitely. Returns `None` once the
    /// collector is cancelled and its buffer is drained.
    pub async fn next_result(&self) -> Option<Stanza> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(stanza) = self.shared.pop() {
                return Some(stanza);
            }
            if self.shared.is_cancelled() {
                return None;
            }
            notified.await;
        }
    }

    /// Await the next match for at most `timeout`. Returns `None` on
    /// expiry or cancellation; the remaining budget is recomputed after
    /// every wake, so spurious wakes cannot extend the deadline.
    pub async fn next_result_timeout(&self, timeout: Duration) -> Option<Stanza> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(stanza) = self.shared.pop() {
                return Some(stanza);
            }
            if self.shared.is_cancelled() {
                return None;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Await the next match using the connection's reply timeout,
    /// distinguishing success, protocol error reply, and no response.
    pub async fn next_result_or_err(&self) -> Result<Stanza, Error> {
        let timeout = self.connection.reply_timeout();
        self.next_result_or_err_timeout(timeout).await
    }

    /// Like [`next_result_or_err`](Self::next_result_or_err) with an
    /// explicit timeout.
    ///
    /// Terminal outcomes are mutually exclusive: a well-formed reply is
    /// returned; a reply whose payload signals a protocol error fails
    /// with [`Error::ErrorReply`] carrying that payload and the
    /// originating request; deadline expiry fails with
    /// [`Error::NoResponse`] naming the filter waited on. A connection
    /// detected as not connected fails immediately instead of waiting
    /// out the timeout, and cancellation mid-wait surfaces as
    /// [`Error::Cancelled`].
    pub async fn next_result_or_err_timeout(&self, timeout: Duration) -> Result<Stanza, Error> {
        if !self.connection.is_connected() {
            return Err(Error::NotConnected);
        }
        match self.next_result_timeout(timeout).await {
            Some(stanza) if stanza.is_error() => {
                let payload = stanza.error().cloned().unwrap_or_else(|| {
                    StanzaError::new(
                        StanzaErrorCondition::UndefinedCondition,
                        StanzaErrorType::Cancel,
                    )
                });
                Err(Error::error_reply(payload, self.request.clone()))
            }
            Some(stanza) => Ok(stanza),
            None if self.shared.is_cancelled() => Err(Error::Cancelled),
            None => Err(Error::no_response(
                format!("{:?}", self.shared.filter),
                timeout,
            )),
        }
    }

    /// Cancel the collector, removing it from the connection's live set.
    ///
    /// Idempotent; safe to call concurrently with an in-flight delivery.
    pub fn cancel(&self) {
        if self.shared.cancel() {
            self.connection.remove_collector(self.id);
        }
    }
}

impl fmt::Debug for StanzaCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StanzaCollector")
            .field("id", &self.id)
            .field("filter", &self.shared.filter)
            .field("cancelled", &self.shared.is_cancelled())
            .finish()
    }
}

impl Drop for StanzaCollector {
    fn drop(&mut self) {
        self.cancel();
    }
}
