//! Background tasks for the feed runtime

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::recovery::RecoveryCoordinator;

/// Spawn the periodic producer sweep.
///
/// Each tick checks alive timeouts and recovery deadlines and flushes changed
/// recovery timestamps. Timestamps are flushed once more on shutdown.
pub fn spawn_recovery_sweeper(
    coordinator: Arc<RecoveryCoordinator>,
    interval: Duration,
    shutdown_tx: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running producer sweep");
                    coordinator.sweep(Utc::now());
                    flush(&coordinator);
                }
                _ = shutdown_rx.recv() => {
                    flush(&coordinator);
                    info!("Recovery sweeper shutting down");
                    break;
                }
            }
        }
    })
}

fn flush(coordinator: &RecoveryCoordinator) {
    if let Err(e) = coordinator.registry().flush_timestamps() {
        warn!(error = %e, "Failed to persist producer timestamps");
    }
}
