//! FeedRuntime end to end over an in-memory broker

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;

use common::MockIssuer;
use uf_amqp::{AmqpChannel, AmqpConnection, ConnectionFactory, DeliveryStream};
use uf_common::{MessageKind, ProducerStatus, RawDelivery};
use uf_config::FeedConfig;
use uf_feed::{FeedError, FeedRuntime, MemoryTimestampStore, MessageInterest};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

struct MockChannel {
    handle: u64,
    closed: AtomicBool,
    bound: parking_lot::Mutex<Vec<String>>,
    sender: parking_lot::Mutex<Option<fmpsc::UnboundedSender<uf_amqp::Result<RawDelivery>>>>,
}

impl MockChannel {
    fn push(&self, body: String, routing_key: &str) {
        if let Some(sender) = self.sender.lock().as_ref() {
            sender
                .unbounded_send(Ok(RawDelivery::new(body.into_bytes(), routing_key)))
                .unwrap();
        }
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    fn handle(&self) -> u64 {
        self.handle
    }

    async fn subscribe(&self, _exchange: &str, routing_keys: &[String]) -> uf_amqp::Result<DeliveryStream> {
        self.bound.lock().extend(routing_keys.iter().cloned());
        let (tx, rx) = fmpsc::unbounded();
        *self.sender.lock() = Some(tx);
        Ok(rx.boxed())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockConnection {
    open: AtomicBool,
    channels: parking_lot::Mutex<Vec<Arc<MockChannel>>>,
}

#[async_trait]
impl AmqpConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> uf_amqp::Result<Arc<dyn AmqpChannel>> {
        let channel = Arc::new(MockChannel {
            handle: NEXT_HANDLE.fetch_add(1, Ordering::SeqCst),
            closed: AtomicBool::new(false),
            bound: parking_lot::Mutex::new(Vec::new()),
            sender: parking_lot::Mutex::new(None),
        });
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockFactory {
    connection: parking_lot::Mutex<Option<Arc<MockConnection>>>,
}

impl MockFactory {
    fn connection(&self) -> Arc<MockConnection> {
        self.connection.lock().clone().unwrap()
    }

    fn channel(&self, index: usize) -> Arc<MockChannel> {
        self.connection().channels.lock()[index].clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self) -> uf_amqp::Result<Arc<dyn AmqpConnection>> {
        let connection = Arc::new(MockConnection {
            open: AtomicBool::new(true),
            channels: parking_lot::Mutex::new(Vec::new()),
        });
        *self.connection.lock() = Some(connection.clone());
        Ok(connection)
    }

    fn endpoint(&self) -> String {
        "mock:5672".to_string()
    }
}

fn config() -> FeedConfig {
    let mut config = FeedConfig::default();
    // Keep background checks out of the way
    config.amqp.channel_check_interval_secs = 3600;
    config.amqp.max_silence_secs = 3600;
    config.producers.sweep_interval_secs = 3600;
    config
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test]
async fn test_runtime_end_to_end() {
    let factory = Arc::new(MockFactory::default());
    let issuer = Arc::new(MockIssuer::new());
    let runtime = FeedRuntime::new(
        config(),
        factory.clone(),
        issuer.clone(),
        Arc::new(MemoryTimestampStore::new()),
    );

    runtime.start().await.unwrap();
    assert!(runtime.is_running());
    assert!(matches!(runtime.start().await, Err(FeedError::InvalidState(_))));

    let system = factory.channel(0);
    assert_eq!(
        *system.bound.lock(),
        MessageInterest::SystemAliveOnly.routing_keys(None)
    );

    let mut session = runtime.open_session(MessageInterest::AllMessages).await.unwrap();
    let session_channel = factory.channel(1);
    assert_eq!(
        *session_channel.bound.lock(),
        MessageInterest::AllMessages.routing_keys(None)
    );
    assert_eq!(runtime.router().session_count(), 1);

    // Alive on the system channel starts recovery
    system.push(
        format!(r#"{{"type":"alive","product":1,"timestamp":{},"subscribed":1}}"#, now_ms()),
        "-.-.-.alive.-.-.-.-",
    );
    eventually(|| runtime.registry().status(1) == Some(ProducerStatus::Starting)).await;
    eventually(|| issuer.call_count() == 1).await;

    session_channel.push(
        format!(r#"{{"type":"snapshot_complete","product":1,"timestamp":{},"request_id":100}}"#, now_ms()),
        "-.-.-.snapshot_complete.-.-.-.-",
    );
    eventually(|| runtime.registry().status(1) == Some(ProducerStatus::Up)).await;

    session_channel.push(
        format!(
            r#"{{"type":"odds_change","product":1,"event_id":"sr:match:42","timestamp":{}}}"#,
            now_ms()
        ),
        "hi.-.live.odds_change.1.sr:match.42.-",
    );
    let message = tokio::time::timeout(Duration::from_secs(2), session.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.kind, MessageKind::OddsChange);
    assert_eq!(message.event_id.as_deref(), Some("sr:match:42"));

    // Closing a session stops its channel and its stream
    runtime.close_session(session.id()).await.unwrap();
    assert!(session_channel.closed.load(Ordering::SeqCst));
    assert!(session.recv().await.is_none());
    assert!(matches!(
        runtime.close_session(session.id()).await,
        Err(FeedError::InvalidArgument(_))
    ));

    runtime.shutdown().await.unwrap();
    assert!(!runtime.is_running());
    assert!(system.closed.load(Ordering::SeqCst));
    assert!(!factory.connection().is_open());

    assert!(matches!(runtime.shutdown().await, Err(FeedError::InvalidState(_))));
    assert!(matches!(
        runtime.open_session(MessageInterest::LiveMessagesOnly).await,
        Err(FeedError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_open_session_before_start_fails() {
    let runtime = FeedRuntime::new(
        config(),
        Arc::new(MockFactory::default()),
        Arc::new(MockIssuer::new()),
        Arc::new(MemoryTimestampStore::new()),
    );

    assert!(matches!(
        runtime.open_session(MessageInterest::AllMessages).await,
        Err(FeedError::InvalidState(_))
    ));
}
