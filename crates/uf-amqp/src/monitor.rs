//! Channel Health Monitor - one self-healing broker channel per session
//!
//! A channel can look connected at the socket layer while receiving nothing
//! (broker-side partition, half-open TCP). The monitor therefore measures time
//! since the last delivery and recreates the channel when it has been silent
//! for longer than `max_silence`.
//!
//! Every tick (timer driven, or explicit via [`ChannelHealthMonitor::check`]):
//! 1. no channel yet -> create one
//! 2. connection newer than the channel -> recreate (channel is stale)
//! 3. consumer stream ended -> recreate
//! 4. nothing ever received and `now - started_at > max_silence` -> recreate
//! 5. last delivery older than `max_silence` -> recreate, resetting the
//!    connection first when it predates the channel
//!
//! Ticks are serialized by a one-permit semaphore; a tick that cannot get the
//! permit is dropped, never queued.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use uf_common::RawDelivery;

use crate::backoff::{BackoffConfig, RecreateBackoff};
use crate::connection::ConnectionManager;
use crate::{AmqpChannel, AmqpError, DeliveryStream, Result};

/// Configuration for a channel health monitor
#[derive(Debug, Clone)]
pub struct ChannelMonitorConfig {
    /// Topic exchange the session queue is bound to
    pub exchange: String,
    /// Health check period
    pub check_interval: Duration,
    /// Max time without deliveries before the channel is recreated
    pub max_silence: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ChannelMonitorConfig {
    fn default() -> Self {
        Self {
            exchange: "unifiedfeed".to_string(),
            check_interval: Duration::from_secs(20),
            max_silence: Duration::from_secs(180),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Lifecycle of a monitor; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MonitorState {
    Idle = 0,
    Opening = 1,
    Open = 2,
    Closed = 3,
}

impl MonitorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MonitorState::Idle,
            1 => MonitorState::Opening,
            2 => MonitorState::Open,
            _ => MonitorState::Closed,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            MonitorState::Idle => "not open",
            MonitorState::Opening => "opening",
            MonitorState::Open => "already open",
            MonitorState::Closed => "closed",
        }
    }
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: MonitorState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> MonitorState {
        MonitorState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn store(&self, state: MonitorState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Compare-and-swap; returns the actual state on failure
    fn transition(&self, from: MonitorState, to: MonitorState) -> std::result::Result<(), MonitorState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(MonitorState::from_u8)
    }
}

/// Why a channel is being (re)created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateReason {
    NoChannel,
    ConnectionReplaced,
    ConsumerEnded,
    NeverReceived,
    Silent { reset_connection: bool },
}

impl RecreateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecreateReason::NoChannel => "no_channel",
            RecreateReason::ConnectionReplaced => "connection_replaced",
            RecreateReason::ConsumerEnded => "consumer_ended",
            RecreateReason::NeverReceived => "never_received",
            RecreateReason::Silent { .. } => "silent",
        }
    }

    fn is_silence(&self) -> bool {
        matches!(self, RecreateReason::NeverReceived | RecreateReason::Silent { .. })
    }
}

/// Result of one health tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick held the slot
    Skipped,
    NotOpen,
    Healthy,
    BackingOff(RecreateReason),
    Recreated(RecreateReason),
    RecreateFailed(RecreateReason),
}

struct ActiveChannel {
    channel: Arc<dyn AmqpChannel>,
    consumer: Option<JoinHandle<()>>,
    generation: u64,
    started_at: DateTime<Utc>,
    last_message_at: Option<DateTime<Utc>>,
}

struct MonitorInner {
    name: String,
    config: ChannelMonitorConfig,
    max_silence: TimeDelta,
    connections: Arc<ConnectionManager>,
    state: AtomicState,
    routing_keys: Mutex<Arc<Vec<String>>>,
    active: Mutex<Option<ActiveChannel>>,
    backoff: Mutex<RecreateBackoff>,
    tick_slot: Semaphore,
    generation: AtomicU64,
    deliveries: mpsc::UnboundedSender<RawDelivery>,
    shutdown_tx: broadcast::Sender<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Owns one channel for one session and keeps it receiving
pub struct ChannelHealthMonitor {
    inner: Arc<MonitorInner>,
}

impl ChannelHealthMonitor {
    /// Create a monitor; deliveries arrive on the returned receiver while open
    pub fn new(
        name: impl Into<String>,
        config: ChannelMonitorConfig,
        connections: Arc<ConnectionManager>,
    ) -> (Self, mpsc::UnboundedReceiver<RawDelivery>) {
        let (deliveries, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let max_silence = TimeDelta::from_std(config.max_silence).unwrap_or(TimeDelta::MAX);

        let inner = MonitorInner {
            name: name.into(),
            backoff: Mutex::new(RecreateBackoff::new(config.backoff.clone())),
            config,
            max_silence,
            connections,
            state: AtomicState::new(MonitorState::Idle),
            routing_keys: Mutex::new(Arc::new(Vec::new())),
            active: Mutex::new(None),
            tick_slot: Semaphore::new(1),
            generation: AtomicU64::new(0),
            deliveries,
            shutdown_tx,
            timer: Mutex::new(None),
        };

        (Self { inner: Arc::new(inner) }, rx)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.load() == MonitorState::Open
    }

    pub fn routing_keys(&self) -> Vec<String> {
        self.inner.routing_keys.lock().as_ref().clone()
    }

    /// Bind to `routing_keys`, start consuming and start the health timer.
    ///
    /// A monitor opens exactly once. If the broker is unreachable the error is
    /// logged and the health ticks keep trying.
    pub async fn open(&self, routing_keys: Vec<String>) -> Result<()> {
        if routing_keys.is_empty() {
            return Err(AmqpError::InvalidArgument(format!(
                "channel monitor {} needs at least one routing key",
                self.inner.name
            )));
        }

        if let Err(actual) = self.inner.state.transition(MonitorState::Idle, MonitorState::Opening) {
            return Err(AmqpError::InvalidState(format!(
                "channel monitor {} cannot be opened: {}",
                self.inner.name,
                actual.describe()
            )));
        }

        *self.inner.routing_keys.lock() = Arc::new(routing_keys);
        self.inner.state.store(MonitorState::Open);

        info!(
            session = %self.inner.name,
            routing_keys = ?self.inner.routing_keys.lock().as_ref(),
            "Opening channel"
        );

        match MonitorInner::tick(&self.inner, Utc::now()).await {
            TickOutcome::Recreated(_) | TickOutcome::Healthy => {}
            outcome => warn!(
                session = %self.inner.name,
                ?outcome,
                "Initial channel creation did not succeed, health checks will retry"
            ),
        }

        self.spawn_timer();
        Ok(())
    }

    /// Stop the timer, detach the consumer and close the channel, in that order
    pub async fn close(&self) -> Result<()> {
        if let Err(actual) = self.inner.state.transition(MonitorState::Open, MonitorState::Closed) {
            return Err(AmqpError::InvalidState(format!(
                "channel monitor {} cannot be closed: {}",
                self.inner.name,
                match actual {
                    MonitorState::Closed => "already closed",
                    other => other.describe(),
                }
            )));
        }

        let _ = self.inner.shutdown_tx.send(());
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            timer.abort();
        }

        // A tick in flight finishes before the channel is torn down
        let _permit = self
            .inner
            .tick_slot
            .acquire()
            .await
            .map_err(|_| AmqpError::InvalidState("tick slot closed".to_string()))?;

        self.inner.teardown_active().await;

        info!(session = %self.inner.name, "Channel closed");
        Ok(())
    }

    /// Run one health check now
    pub async fn check(&self) -> TickOutcome {
        self.check_at(Utc::now()).await
    }

    /// Run one health check as if the current time were `now`
    pub async fn check_at(&self, now: DateTime<Utc>) -> TickOutcome {
        MonitorInner::tick(&self.inner, now).await
    }

    /// Handle of the current channel
    pub fn channel_handle(&self) -> Option<u64> {
        self.inner.active.lock().as_ref().map(|a| a.channel.handle())
    }

    pub fn channel_started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.active.lock().as_ref().map(|a| a.started_at)
    }

    pub fn last_message_received_at(&self) -> Option<DateTime<Utc>> {
        self.inner.active.lock().as_ref().and_then(|a| a.last_message_at)
    }

    fn spawn_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let interval = self.inner.config.check_interval;
        let name = self.inner.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; open() already ran one check
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        // Independent unit of work so a slow recreation never delays the timer
                        tokio::spawn(async move {
                            MonitorInner::tick(&inner, Utc::now()).await;
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(session = %name, "Channel health timer shutting down");
                        break;
                    }
                }
            }
        });

        *self.inner.timer.lock() = Some(handle);
    }
}

impl MonitorInner {
    async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> TickOutcome {
        let _permit = match self.tick_slot.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(session = %self.name, "Channel check already running, skipping tick");
                return TickOutcome::Skipped;
            }
        };

        if self.state.load() != MonitorState::Open {
            return TickOutcome::NotOpen;
        }

        let Some(reason) = self.evaluate(now) else {
            return TickOutcome::Healthy;
        };

        {
            let backoff = self.backoff.lock();
            if !backoff.ready(now) {
                debug!(
                    session = %self.name,
                    reason = reason.as_str(),
                    not_before = ?backoff.not_before(),
                    "Channel recreation backing off"
                );
                return TickOutcome::BackingOff(reason);
            }
        }

        match reason {
            RecreateReason::NoChannel => debug!(session = %self.name, "Creating channel"),
            RecreateReason::Silent { reset_connection: true } => {
                warn!(
                    session = %self.name,
                    max_silence_secs = self.config.max_silence.as_secs(),
                    "Channel silent and connection predates it, resetting connection"
                );
                self.connections.reset().await;
            }
            other => warn!(
                session = %self.name,
                reason = other.as_str(),
                "Recreating channel"
            ),
        }

        match self.recreate().await {
            Ok(handle) => {
                if reason.is_silence() {
                    self.backoff.lock().record_attempt(now);
                }
                if reason != RecreateReason::NoChannel {
                    metrics::counter!(
                        "uf_channel_recreations_total",
                        "session" => self.name.clone(),
                        "reason" => reason.as_str()
                    )
                    .increment(1);
                }
                info!(session = %self.name, channel = handle, reason = reason.as_str(), "Channel ready");
                TickOutcome::Recreated(reason)
            }
            Err(e) => {
                let delay = self.backoff.lock().record_attempt(now);
                metrics::counter!(
                    "uf_channel_recreation_failures_total",
                    "session" => self.name.clone()
                )
                .increment(1);
                warn!(
                    session = %self.name,
                    reason = reason.as_str(),
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "Failed to create channel"
                );
                TickOutcome::RecreateFailed(reason)
            }
        }
    }

    fn evaluate(&self, now: DateTime<Utc>) -> Option<RecreateReason> {
        let active = self.active.lock();
        let Some(active) = active.as_ref() else {
            return Some(RecreateReason::NoChannel);
        };

        let connection_created = self.connections.created_at();
        if connection_created.is_some_and(|created| created > active.started_at) {
            return Some(RecreateReason::ConnectionReplaced);
        }

        if active.consumer.as_ref().is_some_and(|c| c.is_finished()) {
            return Some(RecreateReason::ConsumerEnded);
        }

        match active.last_message_at {
            None if now - active.started_at > self.max_silence => Some(RecreateReason::NeverReceived),
            Some(last) if now - last > self.max_silence => Some(RecreateReason::Silent {
                reset_connection: connection_created.is_some_and(|created| created < active.started_at),
            }),
            _ => None,
        }
    }

    async fn recreate(self: &Arc<Self>) -> Result<u64> {
        self.teardown_active().await;

        let routing_keys = self.routing_keys.lock().clone();
        let connection = self.connections.get_connection().await?;
        let channel = connection.create_channel().await?;

        let stream = match channel.subscribe(&self.config.exchange, &routing_keys).await {
            Ok(stream) => stream,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = channel.handle();

        *self.active.lock() = Some(ActiveChannel {
            channel,
            consumer: None,
            generation,
            started_at: Utc::now(),
            last_message_at: None,
        });

        let consumer = self.spawn_consumer(generation, stream);
        if let Some(active) = self.active.lock().as_mut() {
            active.consumer = Some(consumer);
        }

        Ok(handle)
    }

    fn spawn_consumer(self: &Arc<Self>, generation: u64, mut stream: DeliveryStream) -> JoinHandle<()> {
        let weak: Weak<MonitorInner> = Arc::downgrade(self);
        let deliveries = self.deliveries.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(delivery) => {
                        match weak.upgrade() {
                            Some(inner) => inner.record_delivery(generation, delivery.received_at),
                            None => break,
                        }
                        metrics::counter!("uf_deliveries_received_total", "session" => name.clone())
                            .increment(1);
                        if deliveries.send(delivery).is_err() {
                            debug!(session = %name, "Delivery receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(session = %name, error = %e, "Channel consumer failed");
                        break;
                    }
                }
            }
            debug!(session = %name, generation, "Channel consumer stopped");
        })
    }

    fn record_delivery(&self, generation: u64, at: DateTime<Utc>) {
        let first = {
            let mut active = self.active.lock();
            match active.as_mut() {
                Some(a) if a.generation == generation => {
                    let first = a.last_message_at.is_none();
                    a.last_message_at = Some(at);
                    first
                }
                _ => false,
            }
        };

        if first {
            self.backoff.lock().reset();
        }
    }

    async fn teardown_active(&self) {
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            if let Some(consumer) = previous.consumer {
                consumer.abort();
            }
            previous.channel.close().await;
            debug!(
                session = %self.name,
                channel = previous.channel.handle(),
                "Channel torn down"
            );
        }
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
        if let Some(active) = self.active.get_mut().take() {
            if let Some(consumer) = active.consumer {
                consumer.abort();
            }
        }
    }
}
