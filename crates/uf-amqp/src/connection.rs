//! Shared broker connection.
//!
//! The connection is created lazily on first use and replaced only through
//! [`ConnectionManager::reset`] (or when the client notices it closed).
//! Channels compare [`ConnectionManager::created_at`] with their own start
//! time to detect that the connection was replaced underneath them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{AmqpConnection, ConnectionFactory, Result};

struct CurrentConnection {
    connection: Arc<dyn AmqpConnection>,
    created_at: DateTime<Utc>,
}

pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    current: RwLock<Option<CurrentConnection>>,
    /// Serializes connection creation; readers never wait on it
    create_lock: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            current: RwLock::new(None),
            create_lock: Mutex::new(()),
        }
    }

    /// Return the current connection, creating it if there is none.
    ///
    /// Creation failures propagate to the caller and are not retried here;
    /// the channel health ticks are the retry mechanism.
    pub async fn get_connection(&self) -> Result<Arc<dyn AmqpConnection>> {
        if let Some(connection) = self.open_connection() {
            return Ok(connection);
        }

        let _guard = self.create_lock.lock().await;

        // Another caller may have connected while we waited
        if let Some(connection) = self.open_connection() {
            return Ok(connection);
        }

        let stale = self.current.write().take();
        if let Some(stale) = stale {
            warn!(
                endpoint = %self.factory.endpoint(),
                created_at = %stale.created_at,
                "Broker connection is no longer open, replacing it"
            );
            stale.connection.close().await;
        }

        info!(endpoint = %self.factory.endpoint(), "Connecting to AMQP broker");
        let connection = self.factory.connect().await.map_err(|e| {
            warn!(endpoint = %self.factory.endpoint(), error = %e, "AMQP connection failed");
            metrics::counter!("uf_connection_failures_total").increment(1);
            e
        })?;

        let created_at = Utc::now();
        *self.current.write() = Some(CurrentConnection {
            connection: connection.clone(),
            created_at,
        });
        metrics::counter!("uf_connections_created_total").increment(1);

        info!(endpoint = %self.factory.endpoint(), %created_at, "Connected to AMQP broker");
        Ok(connection)
    }

    /// Close and discard the connection; the next `get_connection` builds a new one
    pub async fn reset(&self) {
        let _guard = self.create_lock.lock().await;
        let previous = self.current.write().take();

        if let Some(previous) = previous {
            warn!(
                endpoint = %self.factory.endpoint(),
                created_at = %previous.created_at,
                "Resetting AMQP connection"
            );
            previous.connection.close().await;
        }
    }

    /// Creation time of the current connection, if one exists
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.current.read().as_ref().map(|c| c.created_at)
    }

    pub fn is_connected(&self) -> bool {
        self.open_connection().is_some()
    }

    /// Close the connection at shutdown
    pub async fn close(&self) {
        let _guard = self.create_lock.lock().await;
        let current = self.current.write().take();
        if let Some(current) = current {
            current.connection.close().await;
            info!(endpoint = %self.factory.endpoint(), "AMQP connection closed");
        }
    }

    fn open_connection(&self) -> Option<Arc<dyn AmqpConnection>> {
        self.current
            .read()
            .as_ref()
            .filter(|c| c.connection.is_open())
            .map(|c| c.connection.clone())
    }
}
