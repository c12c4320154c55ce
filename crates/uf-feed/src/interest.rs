//! Message interests
//!
//! A session's interest decides both the routing keys its queue is bound with
//! and which parsed messages the session router hands to it.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use uf_common::FeedMessageEnvelope;

use crate::error::FeedError;
use crate::routing_key::{Priority, RoutingKey, ABSENT};

const ALIVE_KEY: &str = "-.-.-.alive.#";
const SNAPSHOT_COMPLETE_KEY: &str = "-.-.-.snapshot_complete.-.-.-";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageInterest {
    AllMessages,
    LiveMessagesOnly,
    PrematchMessagesOnly,
    HiPriorityMessagesOnly,
    LowPriorityMessagesOnly,
    VirtualSports,
    /// Only messages about these event urns (`sr:match:1234`)
    SpecifiedEventsOnly(BTreeSet<String>),
    SystemAliveOnly,
}

impl MessageInterest {
    /// Build a specified-events interest, validating every urn
    pub fn specified_events<I, S>(events: I) -> Result<Self, FeedError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let events: BTreeSet<String> = events.into_iter().map(Into::into).collect();
        if events.is_empty() {
            return Err(FeedError::InvalidArgument(
                "specified events interest needs at least one event".to_string(),
            ));
        }
        for event in &events {
            split_urn(event)?;
        }
        Ok(MessageInterest::SpecifiedEventsOnly(events))
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageInterest::AllMessages => "all",
            MessageInterest::LiveMessagesOnly => "live",
            MessageInterest::PrematchMessagesOnly => "prematch",
            MessageInterest::HiPriorityMessagesOnly => "hi",
            MessageInterest::LowPriorityMessagesOnly => "lo",
            MessageInterest::VirtualSports => "virtual",
            MessageInterest::SpecifiedEventsOnly(_) => "specified_events",
            MessageInterest::SystemAliveOnly => "system_alive",
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, MessageInterest::SystemAliveOnly)
    }

    /// Routing keys to bind the session queue with.
    ///
    /// Every pattern is bound for node-less messages (`-`) and, when a node id
    /// is configured, once more for that node. Business interests also bind
    /// snapshot-complete messages so recoveries can finish.
    pub fn routing_keys(&self, node_id: Option<i32>) -> Vec<String> {
        if self.is_system() {
            return vec![ALIVE_KEY.to_string()];
        }

        let patterns: Vec<String> = match self {
            MessageInterest::AllMessages => vec!["*.*.*.*.*.*.*".to_string()],
            MessageInterest::LiveMessagesOnly => vec!["*.*.live.*.*.*.*".to_string()],
            MessageInterest::PrematchMessagesOnly => vec!["*.pre.*.*.*.*.*".to_string()],
            MessageInterest::HiPriorityMessagesOnly => vec!["hi.*.*.*.*.*.*".to_string()],
            MessageInterest::LowPriorityMessagesOnly => vec!["lo.*.*.*.*.*.*".to_string()],
            MessageInterest::VirtualSports => vec!["*.virt.*.*.*.*.*".to_string()],
            MessageInterest::SpecifiedEventsOnly(events) => events
                .iter()
                .filter_map(|urn| split_urn(urn).ok())
                .map(|(prefix, id)| format!("*.*.*.*.*.{}.{}", prefix, id))
                .collect(),
            MessageInterest::SystemAliveOnly => Vec::new(),
        };

        let mut keys = Vec::with_capacity((patterns.len() + 1) * 2);
        for pattern in patterns.iter().map(String::as_str).chain([SNAPSHOT_COMPLETE_KEY]) {
            keys.push(format!("{}.{}", pattern, ABSENT));
            if let Some(node) = node_id {
                keys.push(format!("{}.{}", pattern, node));
            }
        }
        keys
    }

    /// Whether a session with this interest should receive `envelope`.
    ///
    /// Alive messages only reach system sessions; snapshot-complete messages
    /// are consumed by recovery and never reach sessions.
    pub fn matches(&self, envelope: &FeedMessageEnvelope) -> bool {
        if envelope.is_snapshot_complete() {
            return false;
        }
        if envelope.is_alive() || self.is_system() {
            return envelope.is_alive() && self.is_system();
        }

        if *self == MessageInterest::AllMessages {
            return true;
        }

        let Some(key) = RoutingKey::parse(&envelope.routing_key) else {
            return false;
        };

        match self {
            MessageInterest::LiveMessagesOnly => key.live,
            MessageInterest::PrematchMessagesOnly => key.is_prematch(),
            MessageInterest::HiPriorityMessagesOnly => key.priority == Some(Priority::High),
            MessageInterest::LowPriorityMessagesOnly => key.priority == Some(Priority::Low),
            MessageInterest::VirtualSports => key.is_virtual(),
            MessageInterest::SpecifiedEventsOnly(events) => envelope
                .event_id
                .as_ref()
                .or(key.event_id.as_ref())
                .is_some_and(|event| events.contains(event)),
            MessageInterest::AllMessages | MessageInterest::SystemAliveOnly => false,
        }
    }
}

impl fmt::Display for MessageInterest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageInterest::SpecifiedEventsOnly(events) => {
                write!(f, "events:{}", events.iter().cloned().collect::<Vec<_>>().join(","))
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Parses config names: `all`, `live`, `prematch`, `hi`, `lo`, `virtual`,
/// `system_alive`, `events:sr:match:1,sr:match:2`
impl FromStr for MessageInterest {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(events) = s.strip_prefix("events:") {
            return MessageInterest::specified_events(
                events.split(',').map(str::trim).filter(|e| !e.is_empty()),
            );
        }

        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(MessageInterest::AllMessages),
            "live" => Ok(MessageInterest::LiveMessagesOnly),
            "prematch" | "pre" => Ok(MessageInterest::PrematchMessagesOnly),
            "hi" | "high" => Ok(MessageInterest::HiPriorityMessagesOnly),
            "lo" | "low" => Ok(MessageInterest::LowPriorityMessagesOnly),
            "virtual" | "virt" => Ok(MessageInterest::VirtualSports),
            "system_alive" | "alive" => Ok(MessageInterest::SystemAliveOnly),
            other => Err(FeedError::InvalidArgument(format!("unknown message interest: {}", other))),
        }
    }
}

/// `sr:match:1234` -> (`sr:match`, `1234`)
fn split_urn(urn: &str) -> Result<(&str, &str), FeedError> {
    match urn.rsplit_once(':') {
        Some((prefix, id)) if prefix.contains(':') && !id.is_empty() && !id.contains('.') => {
            Ok((prefix, id))
        }
        _ => Err(FeedError::InvalidArgument(format!("invalid event urn: {}", urn))),
    }
}
