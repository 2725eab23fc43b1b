//! End-to-end correlation scenarios: a hub, an emulated peer answering
//! from the outbound queue, and application tasks awaiting replies.

use std::sync::Arc;
use std::time::Duration;

use minidom::Element;
use quill_xmpp::{
    Connection, ConnectionConfig, Error, IqType, KindFilter, Nonza, QName, Stanza, StanzaError,
    StanzaErrorCondition, StanzaErrorType, StanzaKind, StreamElement,
};

const TLS_NS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// Emulated peer: drain the outbound queue and answer every iq request
/// until the queue shuts down.
async fn answer_requests(connection: Connection, fail_ids: &[&str]) {
    while let Ok(element) = connection.outbound().take().await {
        let StreamElement::Stanza(request) = element else {
            continue;
        };
        let Some(id) = request.id().map(str::to_string) else {
            continue;
        };
        let reply = if fail_ids.contains(&id.as_str()) {
            Stanza::iq(IqType::Error).with_id(id).with_error(StanzaError::new(
                StanzaErrorCondition::ItemNotFound,
                StanzaErrorType::Cancel,
            ))
        } else {
            Stanza::iq(IqType::Result).with_id(id)
        };
        connection.route(reply.into());
    }
}

#[tokio::test]
async fn request_reply_round_trip() {
    let connection = Connection::new(ConnectionConfig::default());
    let peer = tokio::spawn(answer_requests(connection.clone(), &[]));

    let reply = connection
        .send_stanza_and_wait(Stanza::iq(IqType::Get).with_id("ping-1"))
        .await
        .expect("peer answers");
    assert_eq!(reply.id(), Some("ping-1"));
    assert_eq!(reply.iq_type(), Some(IqType::Result));
    assert_eq!(connection.live_collectors(), 0);

    connection.close();
    peer.await.expect("peer exits on shutdown");
}

#[tokio::test]
async fn error_reply_surfaces_as_error_with_request_context() {
    let connection = Connection::new(ConnectionConfig::default());
    let peer = tokio::spawn(answer_requests(connection.clone(), &["missing-item"]));

    let outcome = connection
        .send_stanza_and_wait(Stanza::iq(IqType::Get).with_id("missing-item"))
        .await;

    let Err(Error::ErrorReply { error, request }) = &outcome else {
        panic!("expected ErrorReply, got {outcome:?}");
    };
    assert_eq!(error.condition(), StanzaErrorCondition::ItemNotFound);
    assert_eq!(
        request.as_ref().and_then(|r| r.id()),
        Some("missing-item")
    );

    connection.close();
    peer.await.expect("peer exits on shutdown");
}

#[tokio::test]
async fn negotiation_failure_outcome() {
    let connection = Connection::new(ConnectionConfig::default());

    let peer = tokio::spawn({
        let connection = connection.clone();
        async move {
            let element = connection.outbound().take().await.expect("request sent");
            assert_eq!(element.name(), "starttls");
            connection.route(
                Nonza::new(
                    Element::builder("failure", TLS_NS)
                        .append(Element::builder("not-authorized", TLS_NS).build())
                        .build(),
                )
                .into(),
            );
        }
    });

    let outcome = connection
        .send_nonza_and_wait(
            Nonza::new(Element::builder("starttls", TLS_NS).build()),
            QName::new("proceed", TLS_NS),
            QName::new("failure", TLS_NS),
        )
        .await;

    let Err(Error::NonzaFailure { nonza, condition }) = &outcome else {
        panic!("expected NonzaFailure, got {outcome:?}");
    };
    assert_eq!(nonza.name(), "failure");
    assert_eq!(condition.as_deref(), Some("not-authorized"));
    assert_eq!(connection.live_nonza_handlers(), 0);
    peer.await.expect("peer ran");
}

/// Many producers route concurrently against one broad collector; every
/// routed stanza must be observed exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_routing_loses_nothing() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 50;

    let connection = Connection::new(ConnectionConfig::default());
    let collector = connection.collector_with_capacity(
        Arc::new(KindFilter::new(StanzaKind::Message)),
        PRODUCERS * PER_PRODUCER,
    );

    let mut producers = Vec::new();
    for producer in 0..PRODUCERS {
        producers.push(tokio::spawn({
            let connection = connection.clone();
            async move {
                for n in 0..PER_PRODUCER {
                    connection.route(
                        Stanza::message().with_id(format!("{producer}-{n}")).into(),
                    );
                }
            }
        }));
    }
    for producer in producers {
        producer.await.expect("producer ran");
    }

    let mut seen = std::collections::HashSet::new();
    for _ in 0..PRODUCERS * PER_PRODUCER {
        let stanza = collector
            .next_result_timeout(Duration::from_secs(5))
            .await
            .expect("every routed stanza is buffered");
        assert!(seen.insert(stanza.id().expect("producer set an id").to_string()));
    }
    assert!(collector.poll_result().is_none());
}

#[tokio::test]
async fn close_fails_every_pending_wait() {
    let connection = Connection::new(ConnectionConfig {
        reply_timeout: Duration::from_secs(60),
        ..ConnectionConfig::default()
    });

    let pending_reply = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .send_stanza_and_wait(Stanza::iq(IqType::Get).with_id("never"))
                .await
        }
    });
    let pending_nonza = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .send_nonza_and_wait(
                    Nonza::new(Element::builder("starttls", TLS_NS).build()),
                    QName::new("proceed", TLS_NS),
                    QName::new("failure", TLS_NS),
                )
                .await
        }
    });
    tokio::task::yield_now().await;

    connection.close();

    assert!(matches!(
        pending_reply.await.expect("sender ran"),
        Err(Error::Cancelled)
    ));
    assert!(matches!(
        pending_nonza.await.expect("waiter ran"),
        Err(Error::Cancelled)
    ));
    assert!(matches!(
        connection.send_stanza(Stanza::message()).await,
        Err(Error::QueueShutDown(_))
    ));
    assert_eq!(connection.live_collectors(), 0);
    assert_eq!(connection.live_nonza_handlers(), 0);
}
