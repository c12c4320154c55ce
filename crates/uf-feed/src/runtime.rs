//! Feed Runtime - wires channels, receiver, recovery and sessions together
//!
//! Every session gets its own self-healing channel bound with the session's
//! routing keys. An internal system channel is bound to alive messages so
//! producer liveness is tracked whatever the sessions subscribe to. All
//! channels feed one `MessageReceiver`; each channel is drained by its own
//! task, preserving broker order per channel.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use uf_amqp::{BackoffConfig, ChannelHealthMonitor, ChannelMonitorConfig, ConnectionFactory, ConnectionManager};
use uf_common::{default_producer_catalog, FeedEvent, FeedMessageEnvelope, ProducerInfo};
use uf_config::FeedConfig;

use crate::deserializer::{JsonMessageDeserializer, MessageDeserializer};
use crate::error::FeedError;
use crate::events::FeedEventBus;
use crate::interest::MessageInterest;
use crate::lifecycle::spawn_recovery_sweeper;
use crate::producer::ProducerRegistry;
use crate::receiver::MessageReceiver;
use crate::recovery::{RecoveryConfig, RecoveryCoordinator, RecoveryIssuer};
use crate::session::{SessionId, SessionRouter};
use crate::store::TimestampStore;
use crate::Result;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// A subscriber's view of the feed
pub struct FeedSession {
    id: SessionId,
    interest: MessageInterest,
    messages: mpsc::UnboundedReceiver<Arc<FeedMessageEnvelope>>,
}

impl FeedSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn interest(&self) -> &MessageInterest {
        &self.interest
    }

    /// Next message for this session; `None` once the session is closed
    pub async fn recv(&mut self) -> Option<Arc<FeedMessageEnvelope>> {
        self.messages.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<FeedMessageEnvelope>> {
        self.messages.try_recv().ok()
    }
}

struct SessionChannel {
    /// `None` for the internal system channel
    session_id: Option<SessionId>,
    monitor: ChannelHealthMonitor,
    pump: JoinHandle<()>,
}

pub struct FeedRuntime {
    config: FeedConfig,
    monitor_config: ChannelMonitorConfig,
    connections: Arc<ConnectionManager>,
    coordinator: Arc<RecoveryCoordinator>,
    router: Arc<SessionRouter>,
    receiver: Arc<MessageReceiver>,
    events: FeedEventBus,
    state: AtomicU8,
    shutdown_tx: broadcast::Sender<()>,
    channels: Mutex<Vec<SessionChannel>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl FeedRuntime {
    /// Runtime with the default producer catalog and JSON message bodies
    pub fn new(
        config: FeedConfig,
        factory: Arc<dyn ConnectionFactory>,
        issuer: Arc<dyn RecoveryIssuer>,
        store: Arc<dyn TimestampStore>,
    ) -> Self {
        Self::with_components(
            config,
            factory,
            issuer,
            store,
            default_producer_catalog(),
            Arc::new(JsonMessageDeserializer::new()),
        )
    }

    pub fn with_components(
        config: FeedConfig,
        factory: Arc<dyn ConnectionFactory>,
        issuer: Arc<dyn RecoveryIssuer>,
        store: Arc<dyn TimestampStore>,
        catalog: Vec<ProducerInfo>,
        deserializer: Arc<dyn MessageDeserializer>,
    ) -> Self {
        let events = FeedEventBus::default();
        let registry = Arc::new(ProducerRegistry::new(catalog, &config.producers, store));
        let coordinator = Arc::new(RecoveryCoordinator::new(
            registry,
            issuer,
            events.clone(),
            RecoveryConfig::from(&config.producers),
        ));
        let router = Arc::new(SessionRouter::new());
        let receiver = Arc::new(MessageReceiver::new(
            deserializer,
            coordinator.clone(),
            router.clone(),
            events.clone(),
            config.replay,
        ));

        let monitor_config = ChannelMonitorConfig {
            exchange: config.amqp.exchange.clone(),
            check_interval: Duration::from_secs(config.amqp.channel_check_interval_secs),
            max_silence: Duration::from_secs(config.amqp.max_silence_secs),
            backoff: BackoffConfig {
                base: Duration::from_secs(config.amqp.reconnect_backoff_base_secs),
                max: Duration::from_secs(config.amqp.reconnect_backoff_max_secs),
                ..Default::default()
            },
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            monitor_config,
            connections: Arc::new(ConnectionManager::new(factory)),
            coordinator,
            router,
            receiver,
            events,
            state: AtomicU8::new(CREATED),
            shutdown_tx,
            channels: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ProducerRegistry> {
        self.coordinator.registry()
    }

    pub fn coordinator(&self) -> &Arc<RecoveryCoordinator> {
        &self.coordinator
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Open the system channel and start the recovery sweeper
    pub async fn start(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FeedError::InvalidState("feed runtime was already started".to_string()));
        }

        info!(
            node_id = ?self.config.node_id,
            replay = self.config.replay,
            producers = self.registry().ids().len(),
            "Starting feed runtime"
        );

        self.open_channel("system".to_string(), &MessageInterest::SystemAliveOnly, None)
            .await?;

        let sweeper = spawn_recovery_sweeper(
            self.coordinator.clone(),
            Duration::from_secs(self.config.producers.sweep_interval_secs),
            &self.shutdown_tx,
        );
        *self.sweeper.lock() = Some(sweeper);

        Ok(())
    }

    /// Open a session with its own channel
    pub async fn open_session(&self, interest: MessageInterest) -> Result<FeedSession> {
        if !self.is_running() {
            return Err(FeedError::InvalidState("feed runtime is not running".to_string()));
        }

        let (id, messages) = self.router.register(interest.name(), interest.clone());
        let name = format!("{}-{}", interest.name(), id);

        if let Err(e) = self.open_channel(name, &interest, Some(id)).await {
            self.router.unregister(id);
            return Err(e);
        }

        Ok(FeedSession {
            id,
            interest,
            messages,
        })
    }

    /// Close a session's channel and stop routing to it
    pub async fn close_session(&self, id: SessionId) -> Result<()> {
        let channel = {
            let mut channels = self.channels.lock();
            let index = channels
                .iter()
                .position(|c| c.session_id == Some(id))
                .ok_or_else(|| FeedError::InvalidArgument(format!("no open session {}", id)))?;
            channels.remove(index)
        };

        self.router.unregister(id);
        close_channel(channel).await;
        Ok(())
    }

    /// Stop the sweeper and pending recovery calls, close every channel and the connection
    pub async fn shutdown(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(RUNNING, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FeedError::InvalidState("feed runtime is not running".to_string()));
        }

        info!("Feed runtime shutting down");
        let _ = self.shutdown_tx.send(());

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "Recovery sweeper ended abnormally");
            }
        }
        self.coordinator.abort_requests();

        let channels: Vec<SessionChannel> = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            if let Some(id) = channel.session_id {
                self.router.unregister(id);
            }
            close_channel(channel).await;
        }

        self.connections.close().await;
        info!("Feed runtime shutdown complete");
        Ok(())
    }

    async fn open_channel(
        &self,
        name: String,
        interest: &MessageInterest,
        session_id: Option<SessionId>,
    ) -> Result<()> {
        let routing_keys = interest.routing_keys(self.config.node_id);
        let (monitor, mut deliveries) =
            ChannelHealthMonitor::new(name.clone(), self.monitor_config.clone(), self.connections.clone());
        monitor.open(routing_keys).await?;

        let receiver = self.receiver.clone();
        let pump_name = name.clone();
        let pump = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                receiver.process(delivery).await;
            }
            debug!(session = %pump_name, "Delivery pump stopped");
        });

        self.channels.lock().push(SessionChannel {
            session_id,
            monitor,
            pump,
        });
        info!(session = %name, interest = %interest, "Session channel opened");
        Ok(())
    }
}

async fn close_channel(channel: SessionChannel) {
    if let Err(e) = channel.monitor.close().await {
        debug!(session = %channel.monitor.name(), error = %e, "Channel already closed");
    }
    channel.pump.abort();
}
