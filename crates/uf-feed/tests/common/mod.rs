//! Shared test harness: a mock recovery issuer and a fully wired receive pipeline

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{broadcast, watch};

use uf_common::{default_producer_catalog, FeedEvent, ProducerId, ProducerInfo, RawDelivery, RequestId};
use uf_config::ProducerSettings;
use uf_feed::{
    FeedError, FeedEventBus, JsonMessageDeserializer, MemoryTimestampStore, MessageReceiver,
    ProducerRegistry, ReceiveOutcome, RecoveryConfig, RecoveryCoordinator, RecoveryIssuer, SessionRouter,
};

/// Mock issuer recording every call.
///
/// While held, calls are recorded and then block until released.
pub struct MockIssuer {
    next_id: AtomicU64,
    failing: AtomicBool,
    open: watch::Sender<bool>,
    calls: parking_lot::Mutex<Vec<(ProducerId, Option<DateTime<Utc>>)>>,
}

impl MockIssuer {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(100),
            failing: AtomicBool::new(false),
            open: watch::Sender::new(true),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Block every call from now on until [`release`](Self::release)
    pub fn hold(&self) {
        self.open.send_replace(false);
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    pub fn calls(&self) -> Vec<(ProducerId, Option<DateTime<Utc>>)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Wait until `count` calls have reached the issuer
    pub async fn wait_for_calls(&self, count: usize) {
        for _ in 0..200 {
            if self.call_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} recovery calls, saw {}", count, self.call_count());
    }

    async fn record(&self, producer: &ProducerInfo, after: Option<DateTime<Utc>>) -> uf_feed::Result<()> {
        self.calls.lock().push((producer.id, after));

        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        if self.failing.load(Ordering::SeqCst) {
            return Err(FeedError::Recovery("API unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecoveryIssuer for MockIssuer {
    fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn issue_recovery(
        &self,
        producer: &ProducerInfo,
        _request_id: RequestId,
        after: DateTime<Utc>,
    ) -> uf_feed::Result<()> {
        self.record(producer, Some(after)).await
    }

    async fn issue_full_snapshot(&self, producer: &ProducerInfo, _request_id: RequestId) -> uf_feed::Result<()> {
        self.record(producer, None).await
    }
}

pub struct Pipeline {
    pub receiver: MessageReceiver,
    pub coordinator: Arc<RecoveryCoordinator>,
    pub registry: Arc<ProducerRegistry>,
    pub router: Arc<SessionRouter>,
    pub issuer: Arc<MockIssuer>,
    pub store: Arc<MemoryTimestampStore>,
    pub events: broadcast::Receiver<FeedEvent>,
}

pub struct PipelineOptions {
    pub settings: ProducerSettings,
    pub store: MemoryTimestampStore,
    pub replay: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            settings: ProducerSettings::default(),
            store: MemoryTimestampStore::new(),
            replay: false,
        }
    }
}

pub fn pipeline(options: PipelineOptions) -> Pipeline {
    let store = Arc::new(options.store);
    let issuer = Arc::new(MockIssuer::new());
    let bus = FeedEventBus::new(1024);
    let events = bus.subscribe();

    let registry = Arc::new(ProducerRegistry::new(
        default_producer_catalog(),
        &options.settings,
        store.clone(),
    ));
    let coordinator = Arc::new(RecoveryCoordinator::new(
        registry.clone(),
        issuer.clone(),
        bus.clone(),
        RecoveryConfig::from(&options.settings),
    ));
    let router = Arc::new(SessionRouter::new());
    let receiver = MessageReceiver::new(
        Arc::new(JsonMessageDeserializer::new()),
        coordinator.clone(),
        router.clone(),
        bus,
        options.replay,
    );

    Pipeline {
        receiver,
        coordinator,
        registry,
        router,
        issuer,
        store,
        events,
    }
}

impl Pipeline {
    /// Process one delivery and wait for any recovery call it started
    pub async fn process(&self, delivery: RawDelivery) -> ReceiveOutcome {
        let outcome = self.receiver.process(delivery).await;
        self.coordinator.wait_for_requests().await;
        outcome
    }

    /// Sweep at `now` and wait for any recovery call it started
    pub async fn sweep(&self, now: DateTime<Utc>) {
        self.coordinator.sweep(now);
        self.coordinator.wait_for_requests().await;
    }

    /// Events published so far
    pub fn drain_events(&mut self) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    base + TimeDelta::seconds(secs)
}

pub fn alive(producer: ProducerId, subscribed: bool, received_at: DateTime<Utc>) -> RawDelivery {
    let body = format!(
        r#"{{"type":"alive","product":{},"timestamp":{},"subscribed":{}}}"#,
        producer,
        received_at.timestamp_millis(),
        u8::from(subscribed)
    );
    RawDelivery::new(body.into_bytes(), "-.-.-.alive.-.-.-.-").with_received_at(received_at)
}

pub fn snapshot_complete(producer: ProducerId, request_id: RequestId, received_at: DateTime<Utc>) -> RawDelivery {
    let body = format!(
        r#"{{"type":"snapshot_complete","product":{},"timestamp":{},"request_id":{}}}"#,
        producer,
        received_at.timestamp_millis(),
        request_id
    );
    RawDelivery::new(body.into_bytes(), "-.-.-.snapshot_complete.-.-.-.-").with_received_at(received_at)
}

pub fn odds_change(producer: ProducerId, generated_at: DateTime<Utc>, received_at: DateTime<Utc>) -> RawDelivery {
    let body = format!(
        r#"{{"type":"odds_change","product":{},"event_id":"sr:match:1234","timestamp":{},"odds":{{"market":1}}}}"#,
        producer,
        generated_at.timestamp_millis()
    );
    RawDelivery::new(body.into_bytes(), "hi.-.live.odds_change.1.sr:match.1234.-").with_received_at(received_at)
}

/// Bring `producer` up at `now`: alive, recovery, snapshot complete
pub async fn bring_up(pipeline: &Pipeline, producer: ProducerId, now: DateTime<Utc>) -> RequestId {
    pipeline.process(alive(producer, true, now)).await;
    let request_id = pipeline
        .registry
        .state(producer)
        .and_then(|s| s.recovery)
        .map(|r| r.request_id)
        .expect("recovery issued");
    pipeline.process(snapshot_complete(producer, request_id, now)).await;
    request_id
}
