//! Message body decoding
//!
//! The default wire format is a JSON object:
//!
//! ```json
//! {"type": "odds_change", "product": 1, "event_id": "sr:match:1234",
//!  "timestamp": 1700000000000, "request_id": 42, ...}
//! ```
//!
//! Fields other than the envelope fields are kept as the opaque event body.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use uf_common::{FeedPayload, MessageKind, ProducerId, RawDelivery, RequestId};

use crate::error::FeedError;
use crate::Result;

/// Envelope fields decoded from a message body
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub producer_id: ProducerId,
    pub event_id: Option<String>,
    pub kind: MessageKind,
    pub generated_at: DateTime<Utc>,
    pub request_id: Option<RequestId>,
    pub payload: FeedPayload,
}

/// Decodes a delivery body; implementations must not panic on bad input
pub trait MessageDeserializer: Send + Sync {
    fn deserialize(&self, delivery: &RawDelivery) -> Result<DecodedMessage>;
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    product: ProducerId,
    #[serde(default)]
    event_id: Option<String>,
    /// Generation time in milliseconds
    timestamp: i64,
    #[serde(default)]
    request_id: Option<RequestId>,
    #[serde(default)]
    subscribed: Option<u8>,
    #[serde(flatten)]
    body: Map<String, Value>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMessageDeserializer;

impl JsonMessageDeserializer {
    pub fn new() -> Self {
        Self
    }
}

impl MessageDeserializer for JsonMessageDeserializer {
    fn deserialize(&self, delivery: &RawDelivery) -> Result<DecodedMessage> {
        let wire: WireEnvelope = serde_json::from_slice(&delivery.body)
            .map_err(|e| FeedError::Deserialization(e.to_string()))?;

        let kind: MessageKind = wire
            .kind
            .parse()
            .map_err(|e: uf_common::UnknownMessageKind| FeedError::Deserialization(e.to_string()))?;

        let generated_at = DateTime::from_timestamp_millis(wire.timestamp).ok_or_else(|| {
            FeedError::Deserialization(format!("timestamp out of range: {}", wire.timestamp))
        })?;

        if wire.product == 0 {
            return Err(FeedError::Deserialization("product id must be positive".to_string()));
        }

        let payload = match kind {
            MessageKind::Alive => FeedPayload::Alive {
                subscribed: wire.subscribed.map_or(true, |s| s != 0),
            },
            MessageKind::SnapshotComplete => {
                if wire.request_id.is_none() {
                    return Err(FeedError::Deserialization(
                        "snapshot_complete without request_id".to_string(),
                    ));
                }
                FeedPayload::SnapshotComplete
            }
            _ => FeedPayload::Event(wire.body),
        };

        Ok(DecodedMessage {
            producer_id: wire.product,
            event_id: wire.event_id.filter(|e| !e.is_empty()),
            kind,
            generated_at,
            request_id: wire.request_id,
            payload,
        })
    }
}
