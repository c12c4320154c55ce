//! Receive pipeline: decoding, annotation, gating and session dispatch

mod common;

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use common::{alive, at, odds_change, pipeline, snapshot_complete, PipelineOptions};
use uf_common::{FeedEvent, FeedMessageEnvelope, HeaderValue, MessageKind, RawDelivery, TIMESTAMP_HEADER};
use uf_config::ProducerSettings;
use uf_feed::{MessageInterest, ReceiveOutcome};

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_760_000_000_000).unwrap()
}

fn envelope(outcome: ReceiveOutcome) -> Arc<FeedMessageEnvelope> {
    match outcome {
        ReceiveOutcome::Dispatched { envelope, .. } | ReceiveOutcome::Suppressed(envelope) => envelope,
        other => panic!("expected a parsed message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_body_is_dropped_silently() {
    let mut p = pipeline(PipelineOptions::default());

    let outcome = p
        .process(RawDelivery::new(Vec::new(), "hi.-.live.odds_change.1.sr:match.1.-"))
        .await;

    assert_eq!(outcome, ReceiveOutcome::EmptyBody);
    assert!(p.drain_events().is_empty());

    // The pipeline keeps working afterwards
    let outcome = p.process(alive(1, true, base())).await;
    assert!(matches!(outcome, ReceiveOutcome::Dispatched { .. }));
}

#[tokio::test]
async fn test_undecodable_body_raises_failure_event() {
    let mut p = pipeline(PipelineOptions::default());

    let outcome = p
        .process(RawDelivery::new(b"<odds_change/>".to_vec(), "hi.-.live.odds_change.1.sr:match.1.-"))
        .await;
    assert_eq!(outcome, ReceiveOutcome::DeserializationFailed);

    let events = p.drain_events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        FeedEvent::FeedMessageDeserializationFailed { delivery, error } => {
            assert_eq!(&delivery.body[..], b"<odds_change/>");
            assert_eq!(delivery.routing_key, "hi.-.live.odds_change.1.sr:match.1.-");
            assert!(!error.is_empty());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_producer_is_dropped() {
    let mut p = pipeline(PipelineOptions::default());

    let outcome = p.process(odds_change(99, base(), base())).await;

    assert_eq!(outcome, ReceiveOutcome::UnknownProducer(99));
    assert!(p.drain_events().is_empty());
    assert_eq!(p.issuer.call_count(), 0);
}

#[tokio::test]
async fn test_sent_at_from_header_or_generation_time() {
    let p = pipeline(PipelineOptions::default());
    let t0 = base();
    p.process(alive(1, true, t0)).await;

    let generated = at(t0, 1);
    let without_header = envelope(p.process(odds_change(1, generated, at(t0, 2))).await);
    assert_eq!(without_header.sent_at, generated + TimeDelta::milliseconds(1));
    assert_eq!(without_header.generated_at, generated);
    assert_eq!(without_header.received_at, at(t0, 2));

    let sent = at(t0, 1) + TimeDelta::milliseconds(250);
    let delivery = odds_change(1, generated, at(t0, 2))
        .with_header(TIMESTAMP_HEADER, HeaderValue::Int(sent.timestamp_millis()));
    let with_header = envelope(p.process(delivery).await);
    assert_eq!(with_header.sent_at, sent);
}

#[tokio::test]
async fn test_sport_id_comes_from_routing_key() {
    let p = pipeline(PipelineOptions::default());
    let t0 = base();

    let alive_env = envelope(p.process(alive(1, true, t0)).await);
    assert_eq!(alive_env.sport_id, None);

    let odds = envelope(p.process(odds_change(1, t0, t0)).await);
    assert_eq!(odds.kind, MessageKind::OddsChange);
    assert_eq!(odds.sport_id, Some(1));
    assert_eq!(odds.event_id.as_deref(), Some("sr:match:1234"));
}

#[tokio::test]
async fn test_disabled_producer_raises_raw_event_only() {
    let mut p = pipeline(PipelineOptions {
        settings: ProducerSettings {
            disabled: vec![1],
            ..Default::default()
        },
        ..Default::default()
    });
    let (_, mut session) = p.router.register("all", MessageInterest::AllMessages);
    let t0 = base();

    let outcome = p.process(odds_change(1, t0, t0)).await;
    assert!(matches!(outcome, ReceiveOutcome::Suppressed(_)));

    let events = p.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, FeedEvent::RawFeedMessageReceived { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, FeedEvent::FeedMessageReceived(_))));
    assert!(session.try_recv().is_err());
}

#[tokio::test]
async fn test_replay_ignores_availability() {
    let p = pipeline(PipelineOptions {
        replay: true,
        ..Default::default()
    });
    let (_, mut session) = p.router.register("all", MessageInterest::AllMessages);

    // No alive seen yet, so the producer is not available
    assert!(!p.registry.is_available(1));
    let outcome = p.process(odds_change(1, base(), base())).await;

    assert!(matches!(outcome, ReceiveOutcome::Dispatched { sessions: 1, .. }));
    assert!(session.try_recv().is_ok());
}

#[tokio::test]
async fn test_unavailable_producer_is_suppressed_outside_replay() {
    let p = pipeline(PipelineOptions::default());

    let outcome = p.process(odds_change(1, base(), base())).await;
    assert!(matches!(outcome, ReceiveOutcome::Suppressed(_)));
}

#[tokio::test]
async fn test_messages_routed_by_interest() {
    let p = pipeline(PipelineOptions::default());
    let (_, mut all) = p.router.register("all", MessageInterest::AllMessages);
    let (_, mut live) = p.router.register("live", MessageInterest::LiveMessagesOnly);
    let (_, mut prematch) = p.router.register("prematch", MessageInterest::PrematchMessagesOnly);
    let (_, mut system) = p.router.register("system", MessageInterest::SystemAliveOnly);
    let t0 = base();

    p.process(alive(1, true, t0)).await;
    p.process(odds_change(1, t0, at(t0, 1))).await;
    p.process(snapshot_complete(1, 100, at(t0, 2))).await;

    // Alives only reach the system session
    assert!(system.try_recv().unwrap().is_alive());
    assert!(system.try_recv().is_err());

    assert_eq!(all.try_recv().unwrap().kind, MessageKind::OddsChange);
    assert!(all.try_recv().is_err());
    assert_eq!(live.try_recv().unwrap().kind, MessageKind::OddsChange);
    assert!(prematch.try_recv().is_err());
}

#[tokio::test]
async fn test_redelivered_message_reaches_session_once() {
    let p = pipeline(PipelineOptions::default());
    let (_, mut all) = p.router.register("all", MessageInterest::AllMessages);
    let t0 = base();

    p.process(alive(1, true, t0)).await;
    p.process(odds_change(1, t0, at(t0, 1))).await;
    let outcome = p.process(odds_change(1, t0, at(t0, 1))).await;

    assert!(matches!(outcome, ReceiveOutcome::Dispatched { sessions: 0, .. }));
    assert!(all.try_recv().is_ok());
    assert!(all.try_recv().is_err());
}
