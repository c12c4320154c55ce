//! UnifiedFeed Client Core
//!
//! This crate turns broker deliveries into a feed with liveness and recovery
//! guarantees:
//! - RoutingKey: positional routing-key parsing and sport id extraction
//! - MessageInterest: session filters and their queue bindings
//! - MessageReceiver: decode, annotate, gate and dispatch deliveries
//! - ProducerRegistry: producer catalog and per-producer health state
//! - RecoveryCoordinator: Down/Starting/Up state machine and recovery requests
//! - SessionRouter: at-most-once fan-out to sessions
//! - FeedRuntime: channels, sweeper and sessions wired together

pub mod deserializer;
pub mod error;
pub mod events;
pub mod feed_metrics;
pub mod interest;
pub mod lifecycle;
pub mod producer;
pub mod receiver;
pub mod recovery;
pub mod recovery_api;
pub mod routing_key;
pub mod runtime;
pub mod session;
pub mod store;

pub use deserializer::{DecodedMessage, JsonMessageDeserializer, MessageDeserializer};
pub use error::FeedError;
pub use events::FeedEventBus;
pub use interest::MessageInterest;
pub use lifecycle::spawn_recovery_sweeper;
pub use producer::{ProducerRegistry, ProducerState, RecoveryRequest};
pub use receiver::{MessageReceiver, ReceiveOutcome};
pub use recovery::{RecoveryConfig, RecoveryCoordinator, RecoveryIssuer};
pub use recovery_api::HttpRecoveryIssuer;
pub use routing_key::{try_get_sport_id, RoutingKey};
pub use runtime::{FeedRuntime, FeedSession};
pub use session::{SessionId, SessionRouter};
pub use store::{FileTimestampStore, MemoryTimestampStore, ProducerTimestamps, TimestampStore};

pub type Result<T> = std::result::Result<T, FeedError>;
