//! Shared types for the UnifiedFeed client.
//!
//! Holds the producer catalog, message envelope, raw delivery and the
//! observable feed events that flow between the `uf-amqp` and `uf-feed`
//! crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

/// Identifier of an upstream producer (small positive integer).
pub type ProducerId = u32;

/// Identifier of a recovery request, echoed back in snapshot-complete messages.
pub type RequestId = u64;

/// Name of the broker-side header carrying the publish time in milliseconds.
pub const TIMESTAMP_HEADER: &str = "timestamp_in_ms";

// ============================================================================
// Producer Catalog
// ============================================================================

/// Scope of the events a producer publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerScope {
    Live,
    Prematch,
    Virtual,
}

/// Static description of a producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub name: String,
    pub description: String,
    /// Path segment used by the recovery API (`/v1/{api_path}/recovery/...`)
    pub api_path: String,
    pub scopes: Vec<ProducerScope>,
    /// How far back an "after" recovery may reach, in minutes
    pub stateful_recovery_window_minutes: u32,
}

impl ProducerInfo {
    pub fn new(
        id: ProducerId,
        name: &str,
        description: &str,
        api_path: &str,
        scopes: &[ProducerScope],
        stateful_recovery_window_minutes: u32,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            description: description.to_string(),
            api_path: api_path.to_string(),
            scopes: scopes.to_vec(),
            stateful_recovery_window_minutes,
        }
    }

    pub fn has_scope(&self, scope: ProducerScope) -> bool {
        self.scopes.contains(&scope)
    }

    /// Prematch producers publish no live events and get the longer inactivity threshold.
    pub fn is_prematch_only(&self) -> bool {
        self.has_scope(ProducerScope::Prematch) && !self.has_scope(ProducerScope::Live)
    }

    pub fn stateful_recovery_window(&self) -> Duration {
        Duration::minutes(i64::from(self.stateful_recovery_window_minutes))
    }
}

/// The producers known without contacting the API.
pub fn default_producer_catalog() -> Vec<ProducerInfo> {
    use ProducerScope::*;

    vec![
        ProducerInfo::new(1, "LO", "Live Odds", "liveodds", &[Live], 4320),
        ProducerInfo::new(3, "Ctrl", "Betradar Ctrl", "pre", &[Prematch], 4320),
        ProducerInfo::new(4, "BetPal", "BetPal", "betpal", &[Live], 4320),
        ProducerInfo::new(5, "PremiumCricket", "Premium Cricket", "premium_cricket", &[Live, Prematch], 4320),
        ProducerInfo::new(6, "VF", "Virtual football", "vf", &[Virtual], 180),
        ProducerInfo::new(7, "WNS", "World Number Service", "wns", &[Prematch], 4320),
        ProducerInfo::new(8, "VBL", "Virtual Basketball League", "vbl", &[Virtual], 180),
        ProducerInfo::new(9, "VTO", "Virtual Tennis Open", "vto", &[Virtual], 180),
        ProducerInfo::new(10, "VDR", "Virtual Dog Racing", "vdr", &[Virtual], 180),
        ProducerInfo::new(11, "VHC", "Virtual Horse Classics", "vhc", &[Virtual], 180),
        ProducerInfo::new(12, "VTI", "Virtual Tennis In-Play", "vti", &[Virtual], 180),
    ]
}

// ============================================================================
// Message Kinds
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unknown message kind: {0}")]
pub struct UnknownMessageKind(pub String);

/// Kind of a feed message, as named in routing keys and message bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Alive,
    SnapshotComplete,
    OddsChange,
    BetStop,
    BetSettlement,
    RollbackBetSettlement,
    BetCancel,
    RollbackBetCancel,
    FixtureChange,
    Cashout,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Alive,
        MessageKind::SnapshotComplete,
        MessageKind::OddsChange,
        MessageKind::BetStop,
        MessageKind::BetSettlement,
        MessageKind::RollbackBetSettlement,
        MessageKind::BetCancel,
        MessageKind::RollbackBetCancel,
        MessageKind::FixtureChange,
        MessageKind::Cashout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Alive => "alive",
            MessageKind::SnapshotComplete => "snapshot_complete",
            MessageKind::OddsChange => "odds_change",
            MessageKind::BetStop => "bet_stop",
            MessageKind::BetSettlement => "bet_settlement",
            MessageKind::RollbackBetSettlement => "rollback_bet_settlement",
            MessageKind::BetCancel => "bet_cancel",
            MessageKind::RollbackBetCancel => "rollback_bet_cancel",
            MessageKind::FixtureChange => "fixture_change",
            MessageKind::Cashout => "cashout",
        }
    }

    /// Heartbeat and snapshot-completion messages are not scoped to an event.
    pub fn is_system(&self) -> bool {
        matches!(self, MessageKind::Alive | MessageKind::SnapshotComplete)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownMessageKind(s.to_string()))
    }
}

// ============================================================================
// Raw Deliveries and Parsed Envelopes
// ============================================================================

/// A header value carried on a broker delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Text(String),
    Bool(bool),
}

/// A delivery exactly as it came off the channel
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub body: Bytes,
    pub routing_key: String,
    pub headers: BTreeMap<String, HeaderValue>,
    pub received_at: DateTime<Utc>,
}

impl RawDelivery {
    pub fn new(body: impl Into<Bytes>, routing_key: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            routing_key: routing_key.into(),
            headers: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_header(mut self, name: &str, value: HeaderValue) -> Self {
        self.headers.insert(name.to_string(), value);
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Broker-side publish time from the `timestamp_in_ms` header
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        let millis = match self.headers.get(TIMESTAMP_HEADER)? {
            HeaderValue::Int(v) => *v,
            HeaderValue::Text(s) => s.trim().parse().ok()?,
            HeaderValue::Bool(_) => return None,
        };
        DateTime::from_timestamp_millis(millis)
    }
}

/// Per-kind message payload
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPayload {
    Alive { subscribed: bool },
    SnapshotComplete,
    /// Business message body, kept opaque at this layer
    Event(serde_json::Map<String, serde_json::Value>),
}

/// A parsed feed message annotated with routing and timing metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMessageEnvelope {
    pub producer_id: ProducerId,
    /// Opaque "sr:type:number" identifier; absent on system messages
    pub event_id: Option<String>,
    pub kind: MessageKind,
    pub generated_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub request_id: Option<RequestId>,
    pub sport_id: Option<u32>,
    pub routing_key: String,
    pub payload: FeedPayload,
}

impl FeedMessageEnvelope {
    /// Time between generation upstream and receipt here
    pub fn latency(&self) -> Duration {
        self.received_at - self.generated_at
    }

    pub fn is_alive(&self) -> bool {
        self.kind == MessageKind::Alive
    }

    pub fn is_snapshot_complete(&self) -> bool {
        self.kind == MessageKind::SnapshotComplete
    }

    /// `subscribed` flag of an alive message; `None` for other kinds
    pub fn alive_subscribed(&self) -> Option<bool> {
        match self.payload {
            FeedPayload::Alive { subscribed } => Some(subscribed),
            _ => None,
        }
    }
}

// ============================================================================
// Producer Health
// ============================================================================

/// Derived health of a producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProducerStatus {
    /// Not in sync; recovery is needed
    Down,
    /// Recovery issued, waiting for snapshot completion
    Starting,
    /// Alive and in sync
    Up,
}

/// Why a producer was marked down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProducerDownReason {
    /// No alive message within the inactivity threshold
    AliveIntervalViolation,
    /// The producer reported `subscribed=0`
    NotSubscribed,
    /// A recovery request passed its deadline without completing
    RecoveryTimeout,
}

// ============================================================================
// Observable Events
// ============================================================================

/// Events surfaced to the consuming application
#[derive(Debug, Clone)]
pub enum FeedEvent {
    RawFeedMessageReceived {
        delivery: Arc<RawDelivery>,
        envelope: Arc<FeedMessageEnvelope>,
    },
    FeedMessageReceived(Arc<FeedMessageEnvelope>),
    FeedMessageDeserializationFailed {
        delivery: Arc<RawDelivery>,
        error: String,
    },
    ProducerStatusChanged {
        producer_id: ProducerId,
        is_up: bool,
        reason: Option<ProducerDownReason>,
        at: DateTime<Utc>,
    },
    RecoveryInitiated {
        request_id: RequestId,
        producer_id: ProducerId,
        after: Option<DateTime<Utc>>,
    },
    RecoveryCompleted {
        request_id: RequestId,
        producer_id: ProducerId,
        event_id: Option<String>,
    },
}

impl FeedEvent {
    /// Short name used in logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            FeedEvent::RawFeedMessageReceived { .. } => "raw_feed_message_received",
            FeedEvent::FeedMessageReceived(_) => "feed_message_received",
            FeedEvent::FeedMessageDeserializationFailed { .. } => "feed_message_deserialization_failed",
            FeedEvent::ProducerStatusChanged { .. } => "producer_status_changed",
            FeedEvent::RecoveryInitiated { .. } => "recovery_initiated",
            FeedEvent::RecoveryCompleted { .. } => "recovery_completed",
        }
    }
}
