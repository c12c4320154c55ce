//! Message Receiver - turns raw deliveries into envelopes and dispatches them
//!
//! Steps for each delivery:
//! 1. drop empty bodies
//! 2. decode; on failure raise a deserialization-failed event and stop
//! 3. resolve the producer; unknown producers are dropped
//! 4. derive the sport id from the routing key (not for alive/snapshot-complete)
//! 5. stamp `sent_at` from the `timestamp_in_ms` header, else `generated_at + 1ms`
//! 6. raise the raw event, update recovery state, then dispatch unless the
//!    producer is disabled or unavailable (availability is ignored in replay)

use std::sync::Arc;

use chrono::TimeDelta;
use tracing::{debug, trace, warn};

use uf_common::{FeedEvent, FeedMessageEnvelope, ProducerId, RawDelivery};

use crate::deserializer::MessageDeserializer;
use crate::events::FeedEventBus;
use crate::feed_metrics;
use crate::producer::ProducerRegistry;
use crate::recovery::RecoveryCoordinator;
use crate::routing_key::try_get_sport_id;
use crate::session::SessionRouter;

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    EmptyBody,
    DeserializationFailed,
    UnknownProducer(ProducerId),
    /// Parsed, but withheld from sessions
    Suppressed(Arc<FeedMessageEnvelope>),
    /// Parsed and handed to this many sessions
    Dispatched {
        envelope: Arc<FeedMessageEnvelope>,
        sessions: usize,
    },
}

pub struct MessageReceiver {
    deserializer: Arc<dyn MessageDeserializer>,
    registry: Arc<ProducerRegistry>,
    coordinator: Arc<RecoveryCoordinator>,
    router: Arc<SessionRouter>,
    events: FeedEventBus,
    replay: bool,
}

impl MessageReceiver {
    pub fn new(
        deserializer: Arc<dyn MessageDeserializer>,
        coordinator: Arc<RecoveryCoordinator>,
        router: Arc<SessionRouter>,
        events: FeedEventBus,
        replay: bool,
    ) -> Self {
        Self {
            deserializer,
            registry: coordinator.registry().clone(),
            coordinator,
            router,
            events,
            replay,
        }
    }

    pub async fn process(&self, delivery: RawDelivery) -> ReceiveOutcome {
        if delivery.body.is_empty() {
            warn!(routing_key = %delivery.routing_key, "Dropping delivery with empty body");
            feed_metrics::record_empty_delivery();
            return ReceiveOutcome::EmptyBody;
        }

        let delivery = Arc::new(delivery);

        let decoded = match self.deserializer.deserialize(&delivery) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    body_len = delivery.body.len(),
                    error = %e,
                    "Failed to deserialize delivery"
                );
                feed_metrics::record_deserialization_failure();
                self.events.publish(FeedEvent::FeedMessageDeserializationFailed {
                    delivery,
                    error: e.to_string(),
                });
                return ReceiveOutcome::DeserializationFailed;
            }
        };

        let producer_id = decoded.producer_id;
        if !self.registry.contains(producer_id) {
            warn!(
                producer_id,
                routing_key = %delivery.routing_key,
                kind = %decoded.kind,
                "Message from unknown producer dropped"
            );
            feed_metrics::record_unknown_producer(producer_id);
            return ReceiveOutcome::UnknownProducer(producer_id);
        }

        let sport_id = if decoded.kind.is_system() {
            None
        } else {
            try_get_sport_id(&delivery.routing_key, decoded.kind)
        };

        let sent_at = delivery
            .sent_at()
            .unwrap_or(decoded.generated_at + TimeDelta::milliseconds(1));

        let envelope = Arc::new(FeedMessageEnvelope {
            producer_id,
            event_id: decoded.event_id,
            kind: decoded.kind,
            generated_at: decoded.generated_at,
            sent_at,
            received_at: delivery.received_at,
            request_id: decoded.request_id,
            sport_id,
            routing_key: delivery.routing_key.clone(),
            payload: decoded.payload,
        });

        feed_metrics::record_message_received(producer_id, envelope.kind);
        if let Ok(latency) = envelope.latency().to_std() {
            feed_metrics::record_message_latency(envelope.kind, latency);
        }

        self.events.publish(FeedEvent::RawFeedMessageReceived {
            delivery: delivery.clone(),
            envelope: envelope.clone(),
        });

        self.coordinator.on_message(&envelope, delivery.received_at);

        let enabled = self.registry.is_enabled(producer_id);
        let available = self.registry.is_available(producer_id);
        if !enabled || (!available && !self.replay) {
            let reason = if enabled { "unavailable" } else { "disabled" };
            debug!(
                producer_id,
                kind = %envelope.kind,
                reason,
                "Message not dispatched"
            );
            feed_metrics::record_message_suppressed(producer_id, reason);
            return ReceiveOutcome::Suppressed(envelope);
        }

        self.events.publish(FeedEvent::FeedMessageReceived(envelope.clone()));
        let sessions = self.router.dispatch(&envelope);
        trace!(
            producer_id,
            kind = %envelope.kind,
            event_id = ?envelope.event_id,
            sessions,
            "Message dispatched"
        );

        ReceiveOutcome::Dispatched { envelope, sessions }
    }
}
