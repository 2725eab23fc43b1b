//! Connection hub: live registries, dispatch, and the outbound path.
//!
//! The [`Connection`] owns everything the correlation engine shares
//! between tasks: the live-collector registry, the nonza waiter registry,
//! the stanza listener registry, and the shutdownable outbound queue. The
//! (external) reader task feeds every parsed element into
//! [`route`](Connection::route); the (external) writer task drains the
//! queue returned by [`outbound`](Connection::outbound).
//!
//! Registries are owned by the connection and torn down by
//! [`close`](Connection::close) — there is no global state and no
//! weak-reference cleanup. The queue's internal lock and the registries
//! are never held across one another, so no lock-order relationship
//! exists between the two.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace};

use crate::collector::{CollectorShared, StanzaCollector, DEFAULT_COLLECTOR_CAPACITY};
use crate::error::Error;
use crate::filter::{IdFilter, StanzaFilter};
use crate::nonza::{same_cell, NonzaSlot, NonzaWaiter, OutcomeCell};
use crate::queue::{ShutdownableQueue, DEFAULT_QUEUE_CAPACITY};
use crate::stanza::{Nonza, QName, Stanza, StreamElement};

/// Default maximum wait for a correlated reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection-level configuration consumed by the correlation engine.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Default maximum wait for a correlated reply.
    pub reply_timeout: Duration,
    /// Capacity of the outbound element queue.
    pub send_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            send_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

struct ListenerEntry {
    filter: Arc<dyn StanzaFilter>,
    sender: mpsc::UnboundedSender<Stanza>,
}

/// Shared connection state. Application-facing handles ([`Connection`],
/// collectors, listener handles) all reference this.
pub(crate) struct ConnectionInner {
    collectors: DashMap<u64, Arc<CollectorShared>>,
    nonza_waiters: DashMap<QName, NonzaSlot>,
    listeners: DashMap<u64, ListenerEntry>,
    next_id: AtomicU64,
    outbound: ShutdownableQueue<StreamElement>,
    connected: AtomicBool,
    reply_timeout: Mutex<Duration>,
}

impl ConnectionInner {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn reply_timeout(&self) -> Duration {
        *self
            .reply_timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn remove_collector(&self, id: u64) {
        self.collectors.remove(&id);
    }

    /// Insert a nonza listener unless one is already registered for this
    /// qualified name.
    pub(crate) fn install_nonza_slot(&self, name: QName, slot: NonzaSlot) -> bool {
        match self.nonza_waiters.entry(name) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
        }
    }

    /// Remove a nonza listener, but only if it still belongs to the
    /// given waiter (identity-checked by outcome cell).
    pub(crate) fn remove_nonza_slot(&self, name: &QName, cell: &OutcomeCell) {
        self.nonza_waiters.remove_if(name, |_, slot| same_cell(slot, cell));
    }
}

/// A connection-scoped correlation hub.
///
/// Cloning is cheap and hands out another handle to the same hub.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a live hub with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                collectors: DashMap::new(),
                nonza_waiters: DashMap::new(),
                listeners: DashMap::new(),
                next_id: AtomicU64::new(0),
                outbound: ShutdownableQueue::new(config.send_queue_capacity),
                connected: AtomicBool::new(true),
                reply_timeout: Mutex::new(config.reply_timeout),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    /// The connection-wide default maximum wait for a correlated reply.
    pub fn reply_timeout(&self) -> Duration {
        self.inner.reply_timeout()
    }

    pub fn set_reply_timeout(&self, timeout: Duration) {
        let mut slot = self
            .inner
            .reply_timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = timeout;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Lifecycle hook for the connection state machine.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Release);
    }

    /// The outbound element queue, for the writer task.
    pub fn outbound(&self) -> &ShutdownableQueue<StreamElement> {
        &self.inner.outbound
    }

    /// Register a collector with the default single-shot capacity.
    ///
    /// The collector is visible to [`route`](Self::route) before this
    /// call returns, so a reply to a request sent immediately afterwards
    /// cannot be missed.
    pub fn collector(&self, filter: Arc<dyn StanzaFilter>) -> StanzaCollector {
        self.collector_with_capacity(filter, DEFAULT_COLLECTOR_CAPACITY)
    }

    /// Register a collector with an explicit result-ring capacity, for
    /// streaming multi-result consumption.
    pub fn collector_with_capacity(
        &self,
        filter: Arc<dyn StanzaFilter>,
        capacity: usize,
    ) -> StanzaCollector {
        self.register_collector(filter, capacity, None)
    }

    /// Register a collector correlating replies to `request` by id, and
    /// record the request for error-reply context.
    pub fn collector_for_request(&self, request: &Stanza) -> Result<StanzaCollector, Error> {
        let filter = Arc::new(IdFilter::for_request(request)?);
        Ok(self.register_collector(filter, DEFAULT_COLLECTOR_CAPACITY, Some(request.clone())))
    }

    fn register_collector(
        &self,
        filter: Arc<dyn StanzaFilter>,
        capacity: usize,
        request: Option<Stanza>,
    ) -> StanzaCollector {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(CollectorShared::new(filter, capacity));
        self.inner.collectors.insert(id, Arc::clone(&shared));
        StanzaCollector::new(id, shared, Arc::clone(&self.inner), request)
    }

    /// Register a long-lived listener for every stanza the filter
    /// accepts. Results arrive on the returned handle in wire order.
    pub fn listen(&self, filter: Arc<dyn StanzaFilter>) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.listeners.insert(id, ListenerEntry { filter, sender });
        ListenerHandle {
            id,
            inner: Arc::clone(&self.inner),
            receiver,
        }
    }

    /// Enqueue a stanza for the writer task, assigning a fresh id when
    /// the stanza carries none.
    pub async fn send_stanza(&self, stanza: Stanza) -> Result<(), Error> {
        let stanza = self.ensure_id(stanza);
        self.inner.outbound.put(StreamElement::Stanza(stanza)).await?;
        Ok(())
    }

    /// Enqueue a nonza for the writer task.
    pub async fn send_nonza(&self, nonza: Nonza) -> Result<(), Error> {
        self.inner.outbound.put(StreamElement::Nonza(nonza)).await?;
        Ok(())
    }

    /// Send a request and await its correlated reply.
    ///
    /// The id collector is installed before the request is enqueued and
    /// cancelled on every path, so no reply window is ever left open.
    pub async fn send_stanza_and_wait(&self, request: Stanza) -> Result<Stanza, Error> {
        let request = self.ensure_id(request);
        let collector = self.collector_for_request(&request)?;
        self.inner.outbound.put(StreamElement::Stanza(request)).await?;
        let outcome = collector.next_result_or_err().await;
        collector.cancel();
        outcome
    }

    /// Send a negotiation request and await exactly one of two outcomes:
    /// the `success` element is returned, the `failure` element fails
    /// with [`Error::NonzaFailure`].
    ///
    /// Listeners are installed before the request is sent and removed
    /// exactly once on every path, including a failed send.
    pub async fn send_nonza_and_wait(
        &self,
        request: Nonza,
        success: QName,
        failure: QName,
    ) -> Result<Nonza, Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let timeout = self.reply_timeout();
        let (waiter, receiver) = NonzaWaiter::install(&self.inner, success, failure)?;
        self.inner.outbound.put(StreamElement::Nonza(request)).await?;
        waiter.wait(receiver, timeout).await
    }

    /// Dispatch one parsed inbound element.
    ///
    /// Called by the single reader task for every element, in wire
    /// order. Stanzas are offered to every live collector and listener;
    /// nonzas resolve the waiter registered under their qualified name.
    /// A failing recipient never prevents delivery to the rest.
    #[instrument(name = "quill.route", skip_all, fields(element = element.name()))]
    pub fn route(&self, element: StreamElement) {
        if !self.is_connected() {
            trace!("dropping element routed after close");
            return;
        }
        match element {
            StreamElement::Stanza(stanza) => self.route_stanza(stanza),
            StreamElement::Nonza(nonza) => self.route_nonza(nonza),
        }
    }

    fn route_stanza(&self, stanza: Stanza) {
        for entry in self.inner.collectors.iter() {
            entry.value().deliver(&stanza);
        }

        let mut dead = Vec::new();
        for entry in self.inner.listeners.iter() {
            let listener = entry.value();
            if listener.filter.accept(&stanza) && listener.sender.send(stanza.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.inner.listeners.remove(&id);
            debug!(listener = id, "removed dead stanza listener");
        }
    }

    fn route_nonza(&self, nonza: Nonza) {
        let qname = nonza.qname();
        match self.inner.nonza_waiters.get(&qname) {
            Some(slot) => slot.fire(nonza),
            None => debug!(nonza = %qname, "no waiter registered for nonza"),
        }
    }

    /// Tear the hub down: mark disconnected, shut down the outbound
    /// queue, cancel every collector, abort every nonza waiter, drop
    /// every listener. Idempotent.
    pub fn close(&self) {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.outbound.shutdown();

        for entry in self.inner.collectors.iter() {
            entry.value().cancel();
        }
        self.inner.collectors.clear();

        for entry in self.inner.nonza_waiters.iter() {
            entry.value().abort();
        }
        self.inner.nonza_waiters.clear();

        self.inner.listeners.clear();
        info!("connection closed; correlation registries torn down");
    }

    /// Number of live collectors (diagnostics).
    pub fn live_collectors(&self) -> usize {
        self.inner.collectors.len()
    }

    /// Number of live nonza listener entries (diagnostics). A paired
    /// waiter accounts for two entries.
    pub fn live_nonza_handlers(&self) -> usize {
        self.inner.nonza_waiters.len()
    }

    fn ensure_id(&self, stanza: Stanza) -> Stanza {
        if stanza.id().is_some() {
            stanza
        } else {
            stanza.with_id(uuid::Uuid::new_v4().to_string())
        }
    }
}

/// A registered long-lived stanza listener. Dropping the handle (or
/// calling [`remove`](Self::remove)) deregisters it.
pub struct ListenerHandle {
    id: u64,
    inner: Arc<ConnectionInner>,
    receiver: mpsc::UnboundedReceiver<Stanza>,
}

impl ListenerHandle {
    /// Await the next accepted stanza. Returns `None` once the
    /// connection has been closed.
    pub async fn next(&mut self) -> Option<Stanza> {
        self.receiver.recv().await
    }

    /// Take the next accepted stanza without waiting.
    pub fn try_next(&mut self) -> Option<Stanza> {
        self.receiver.try_recv().ok()
    }

    /// Deregister the listener.
    pub fn remove(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.inner.listeners.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::KindFilter;
    use crate::stanza::{IqType, StanzaKind};

    fn connection() -> Connection {
        Connection::new(ConnectionConfig::default())
    }

    /// Answer the next outbound iq request with a result of the same id.
    async fn echo_one_reply(connection: &Connection) {
        let element = connection.outbound().take().await.expect("request enqueued");
        let StreamElement::Stanza(request) = element else {
            panic!("expected a stanza on the outbound queue");
        };
        let id = request.id().expect("outbound request carries an id");
        connection.route(Stanza::iq(IqType::Result).with_id(id).into());
    }

    #[tokio::test]
    async fn send_and_wait_returns_the_correlated_reply() {
        let connection = connection();

        let responder = tokio::spawn({
            let connection = connection.clone();
            async move { echo_one_reply(&connection).await }
        });

        let reply = connection
            .send_stanza_and_wait(Stanza::iq(IqType::Get).with_id("r1"))
            .await
            .expect("reply arrives");
        assert_eq!(reply.id(), Some("r1"));
        assert_eq!(connection.live_collectors(), 0);
        responder.await.expect("responder ran");
    }

    #[tokio::test]
    async fn send_and_wait_assigns_a_fresh_id_when_missing() {
        let connection = connection();

        let responder = tokio::spawn({
            let connection = connection.clone();
            async move { echo_one_reply(&connection).await }
        });

        let reply = connection
            .send_stanza_and_wait(Stanza::iq(IqType::Get))
            .await
            .expect("reply arrives");
        assert!(reply.id().is_some_and(|id| !id.is_empty()));
        responder.await.expect("responder ran");
    }

    #[tokio::test]
    async fn listeners_receive_matches_in_wire_order() {
        let connection = connection();
        let mut listener = connection.listen(Arc::new(KindFilter::new(StanzaKind::Message)));

        for id in ["m1", "m2", "m3"] {
            connection.route(Stanza::message().with_id(id).into());
        }
        connection.route(Stanza::presence().with_id("ignored").into());

        for expected in ["m1", "m2", "m3"] {
            let received = listener.next().await.expect("listener is live");
            assert_eq!(received.id(), Some(expected));
        }
        assert!(listener.try_next().is_none());
    }

    #[tokio::test]
    async fn dead_listener_does_not_block_the_rest() {
        let connection = connection();
        let dropped = connection.listen(Arc::new(KindFilter::new(StanzaKind::Message)));
        let mut live = connection.listen(Arc::new(KindFilter::new(StanzaKind::Message)));
        drop(dropped);

        connection.route(Stanza::message().with_id("m1").into());

        let received = live.next().await.expect("live listener still served");
        assert_eq!(received.id(), Some("m1"));
    }

    #[tokio::test]
    async fn close_tears_down_every_registry_and_wakes_waiters() {
        let connection = connection();
        let collector =
            connection.collector(Arc::new(KindFilter::new(StanzaKind::Message)));
        let _listener = connection.listen(Arc::new(KindFilter::new(StanzaKind::Message)));

        let pending = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .send_stanza_and_wait(Stanza::iq(IqType::Get).with_id("r1"))
                    .await
            }
        });
        tokio::task::yield_now().await;

        connection.close();

        assert!(matches!(collector.next_result().await, None));
        let outcome = pending.await.expect("pending sender ran");
        assert!(outcome.is_err(), "a pending wait must fail on close");
        assert!(connection.send_stanza(Stanza::message()).await.is_err());
        assert_eq!(connection.live_collectors(), 0);
        assert_eq!(connection.live_nonza_handlers(), 0);
    }

    #[tokio::test]
    async fn route_after_close_drops_elements() {
        let connection = connection();
        let collector = connection.collector(Arc::new(KindFilter::new(StanzaKind::Message)));
        connection.close();

        connection.route(Stanza::message().with_id("m1").into());
        assert!(collector.poll_result().is_none());
    }

    #[tokio::test]
    async fn reply_timeout_is_configurable() {
        let connection = connection();
        assert_eq!(connection.reply_timeout(), DEFAULT_REPLY_TIMEOUT);

        connection.set_reply_timeout(Duration::from_millis(250));
        assert_eq!(connection.reply_timeout(), Duration::from_millis(250));
    }
}
