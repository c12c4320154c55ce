//! Broker plumbing for the UnifiedFeed client.
//!
//! - `ConnectionManager`: owns the single shared broker connection
//! - `ChannelHealthMonitor`: one self-healing channel per session
//! - `RecreateBackoff`: spacing between channel recreations that produce no traffic
//! - `rabbitmq`: lapin implementation of the broker traits (feature `rabbitmq`)

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uf_common::RawDelivery;

pub mod backoff;
pub mod connection;
pub mod error;
pub mod monitor;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

pub use backoff::{BackoffConfig, RecreateBackoff};
pub use connection::ConnectionManager;
pub use error::AmqpError;
pub use monitor::{ChannelHealthMonitor, ChannelMonitorConfig, RecreateReason, TickOutcome};

pub type Result<T> = std::result::Result<T, AmqpError>;

/// Deliveries of one channel, in broker order
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Creates broker connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection; failures are transport errors
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>>;

    /// Broker endpoint for logs (no credentials)
    fn endpoint(&self) -> String;
}

/// An open broker connection shared by all channels
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>>;

    async fn close(&self);
}

/// A channel on a broker connection
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Process-unique handle, distinct for every channel ever created
    fn handle(&self) -> u64;

    /// Declare an exclusive server-named queue, bind it to `exchange` once per
    /// routing key and start consuming from it.
    async fn subscribe(&self, exchange: &str, routing_keys: &[String]) -> Result<DeliveryStream>;

    async fn close(&self);
}
