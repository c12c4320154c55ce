//! UnifiedFeed Listener
//!
//! Connects to the feed broker, opens one session per configured message
//! interest and logs every message and feed event until interrupted.
//!
//! Configuration comes from `unifiedfeed.toml` (or `UNIFIEDFEED_CONFIG`) with
//! `UNIFIEDFEED_*` environment overrides.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use uf_amqp::rabbitmq::{LapinConnectionFactory, RabbitMqConfig};
use uf_common::FeedEvent;
use uf_config::ConfigLoader;
use uf_feed::{
    FeedRuntime, FeedSession, FileTimestampStore, HttpRecoveryIssuer, MemoryTimestampStore, MessageInterest,
    TimestampStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    uf_common::logging::init_logging("uf-listener");

    info!("Starting UnifiedFeed listener");

    let config = ConfigLoader::new().load().context("failed to load configuration")?;

    let interests = config
        .sessions
        .iter()
        .map(|name| name.parse::<MessageInterest>())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid session interest in configuration")?;

    let factory = Arc::new(LapinConnectionFactory::new(RabbitMqConfig {
        uri: config.amqp.uri(),
        endpoint: format!("{}:{}", config.amqp.host, config.amqp.port),
        client_name: config.amqp.client_name.clone(),
        ..Default::default()
    }));

    let issuer = Arc::new(
        HttpRecoveryIssuer::new(&config.api, config.node_id).context("failed to build recovery API client")?,
    );

    let store: Arc<dyn TimestampStore> = if config.producers.timestamp_store_path.trim().is_empty() {
        warn!("No timestamp store path configured, recovery timestamps will not survive restarts");
        Arc::new(MemoryTimestampStore::new())
    } else {
        Arc::new(FileTimestampStore::new(&config.producers.timestamp_store_path))
    };

    let runtime = Arc::new(FeedRuntime::new(config, factory, issuer, store));
    spawn_event_logger(&runtime);

    runtime.start().await.context("failed to start feed runtime")?;

    for interest in interests {
        match runtime.open_session(interest.clone()).await {
            Ok(session) => spawn_session_logger(session),
            Err(e) => {
                error!(interest = %interest, error = %e, "Failed to open session");
                if let Err(e) = runtime.shutdown().await {
                    warn!(error = %e, "Shutdown after failed session open did not complete");
                }
                return Err(anyhow::anyhow!("session {} failed to open: {}", interest, e));
            }
        }
    }

    info!("UnifiedFeed listener started, press Ctrl+C to stop");

    shutdown_signal().await;
    info!("Shutdown signal received");

    runtime.shutdown().await.context("feed runtime shutdown failed")?;
    info!("UnifiedFeed listener stopped");
    Ok(())
}

fn spawn_event_logger(runtime: &FeedRuntime) {
    let mut events = runtime.subscribe_events();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event logger fell behind, events skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn log_event(event: &FeedEvent) {
    match event {
        FeedEvent::ProducerStatusChanged { producer_id, is_up, reason, at } => {
            info!(producer_id, is_up, reason = ?reason, at = %at, "Producer status changed");
        }
        FeedEvent::RecoveryInitiated { request_id, producer_id, after } => {
            info!(producer_id, request_id, after = ?after, "Recovery initiated");
        }
        FeedEvent::RecoveryCompleted { request_id, producer_id, .. } => {
            info!(producer_id, request_id, "Recovery completed");
        }
        FeedEvent::FeedMessageDeserializationFailed { delivery, error } => {
            warn!(
                routing_key = %delivery.routing_key,
                body_len = delivery.body.len(),
                error = %error,
                "Undecodable feed message"
            );
        }
        other => debug!(event = other.name(), "Feed event"),
    }
}

fn spawn_session_logger(mut session: FeedSession) {
    tokio::spawn(async move {
        let session_id = session.id();
        let interest = session.interest().to_string();

        while let Some(message) = session.recv().await {
            info!(
                session_id,
                interest = %interest,
                producer_id = message.producer_id,
                kind = %message.kind,
                event_id = ?message.event_id,
                sport_id = ?message.sport_id,
                latency_ms = message.latency().num_milliseconds(),
                "Feed message"
            );
        }

        debug!(session_id, "Session stream ended");
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
