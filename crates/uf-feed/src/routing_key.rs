//! Routing key parsing
//!
//! Feed routing keys have eight dot-separated positional segments:
//!
//! ```text
//! {priority}.{prematch}.{live}.{kind}.{sport}.{urn_prefix}.{urn_id}.{node}
//! hi.-.live.odds_change.1.sr:match.1234.-
//! -.-.-.alive.-.-.-.-
//! ```
//!
//! `-` marks an absent segment.

use uf_common::MessageKind;

pub const SEGMENT_COUNT: usize = 8;

/// Marker for an absent segment
pub const ABSENT: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// Scope marker carried in the second segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrematchScope {
    Prematch,
    Virtual,
}

/// The positional segments of a routing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub priority: Option<Priority>,
    pub prematch: Option<PrematchScope>,
    pub live: bool,
    /// Raw kind segment, not validated against known kinds
    pub kind: String,
    pub sport_id: Option<u32>,
    /// Event urn, e.g. `sr:match:1234`
    pub event_id: Option<String>,
    pub node_id: Option<i32>,
}

impl RoutingKey {
    /// Split a routing key into its segments; `None` when the key does not
    /// have the expected shape.
    pub fn parse(routing_key: &str) -> Option<Self> {
        let segments: Vec<&str> = routing_key.split('.').collect();
        if segments.len() != SEGMENT_COUNT {
            return None;
        }

        let priority = match segments[0] {
            "hi" => Some(Priority::High),
            "lo" => Some(Priority::Low),
            _ => None,
        };
        let prematch = match segments[1] {
            "pre" => Some(PrematchScope::Prematch),
            "virt" => Some(PrematchScope::Virtual),
            _ => None,
        };
        let kind = segments[3];
        if kind.is_empty() || kind == ABSENT {
            return None;
        }

        let event_id = match (present(segments[5]), present(segments[6])) {
            (Some(prefix), Some(id)) => Some(format!("{}:{}", prefix, id)),
            _ => None,
        };

        Some(Self {
            priority,
            prematch,
            live: segments[2] == "live",
            kind: kind.to_string(),
            sport_id: present(segments[4]).and_then(|s| s.parse().ok()),
            event_id,
            node_id: present(segments[7]).and_then(|s| s.parse().ok()),
        })
    }

    pub fn is_prematch(&self) -> bool {
        self.prematch == Some(PrematchScope::Prematch)
    }

    pub fn is_virtual(&self) -> bool {
        self.prematch == Some(PrematchScope::Virtual)
    }
}

fn present(segment: &str) -> Option<&str> {
    if segment.is_empty() || segment == ABSENT {
        None
    } else {
        Some(segment)
    }
}

/// Sport id embedded in `routing_key` for a message of kind `kind`.
///
/// Alive and snapshot-complete messages are not event scoped and always yield
/// `None`. A key whose kind segment does not name `kind`, or whose sport
/// segment is absent or not numeric, also yields `None`.
pub fn try_get_sport_id(routing_key: &str, kind: MessageKind) -> Option<u32> {
    if kind.is_system() {
        return None;
    }

    let key = RoutingKey::parse(routing_key)?;
    if key.kind != kind.as_str() {
        return None;
    }
    key.sport_id
}
