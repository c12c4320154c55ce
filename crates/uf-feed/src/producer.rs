//! Producer Registry - catalog of producers and their mutable health state
//!
//! The set of producers is fixed at construction. Each producer's state sits
//! behind its own lock, so liveness updates for one producer never contend
//! with sweeps of another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use uf_common::{ProducerDownReason, ProducerId, ProducerInfo, ProducerStatus, RequestId};
use uf_config::ProducerSettings;

use crate::error::FeedError;
use crate::store::{ProducerTimestamps, TimestampStore};
use crate::Result;

/// An outstanding recovery request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub request_id: RequestId,
    pub producer_id: ProducerId,
    /// Absent for a full snapshot
    pub after: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub completed: bool,
}

/// Mutable health state of one producer
#[derive(Debug, Clone)]
pub struct ProducerState {
    pub status: ProducerStatus,
    pub enabled: bool,
    /// Messages are dispatched only while available
    pub available: bool,
    /// Set by down detection, cleared by the next alive
    pub suspended: bool,
    pub last_alive_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_timestamp_before_disconnect: Option<DateTime<Utc>>,
    pub recovery: Option<RecoveryRequest>,
    /// A recovery call to the API is in flight
    pub issuing: bool,
    pub last_recovery_attempt_at: Option<DateTime<Utc>>,
    pub down_reason: Option<ProducerDownReason>,
}

impl ProducerState {
    fn new(enabled: bool, last_timestamp_before_disconnect: Option<DateTime<Utc>>) -> Self {
        Self {
            status: ProducerStatus::Down,
            enabled,
            available: false,
            suspended: false,
            last_alive_at: None,
            last_message_at: None,
            last_timestamp_before_disconnect,
            recovery: None,
            issuing: false,
            last_recovery_attempt_at: None,
            down_reason: None,
        }
    }

    pub fn recovery_in_progress(&self) -> bool {
        self.recovery.is_some() || self.issuing
    }
}

struct ProducerEntry {
    info: ProducerInfo,
    inactivity_threshold: TimeDelta,
    state: Mutex<ProducerState>,
}

pub struct ProducerRegistry {
    producers: HashMap<ProducerId, ProducerEntry>,
    store: Arc<dyn TimestampStore>,
    /// Timestamps changed since the last flush
    dirty: AtomicBool,
}

impl ProducerRegistry {
    /// Build the registry from a catalog, loading persisted timestamps.
    ///
    /// Unreadable timestamps are logged and ignored; producers then start with a
    /// full snapshot.
    pub fn new(
        catalog: Vec<ProducerInfo>,
        settings: &ProducerSettings,
        store: Arc<dyn TimestampStore>,
    ) -> Self {
        let stored = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load producer timestamps, starting without them");
            ProducerTimestamps::new()
        });

        let live_threshold = seconds(settings.inactivity_seconds);
        let prematch_threshold = seconds(settings.inactivity_seconds_prematch);

        let producers = catalog
            .into_iter()
            .map(|info| {
                let enabled = !settings.disabled.contains(&info.id);
                let inactivity_threshold = if info.is_prematch_only() {
                    prematch_threshold
                } else {
                    live_threshold
                };
                let state = ProducerState::new(enabled, stored.get(&info.id).copied());
                (
                    info.id,
                    ProducerEntry {
                        info,
                        inactivity_threshold,
                        state: Mutex::new(state),
                    },
                )
            })
            .collect::<HashMap<_, _>>();

        info!(
            producers = producers.len(),
            disabled = ?settings.disabled,
            restored_timestamps = stored.len(),
            "Producer registry initialized"
        );

        Self {
            producers,
            store,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn contains(&self, producer_id: ProducerId) -> bool {
        self.producers.contains_key(&producer_id)
    }

    pub fn info(&self, producer_id: ProducerId) -> Option<&ProducerInfo> {
        self.producers.get(&producer_id).map(|e| &e.info)
    }

    /// Producer ids in ascending order
    pub fn ids(&self) -> Vec<ProducerId> {
        let mut ids: Vec<_> = self.producers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn inactivity_threshold(&self, producer_id: ProducerId) -> Option<TimeDelta> {
        self.producers.get(&producer_id).map(|e| e.inactivity_threshold)
    }

    /// Copy of a producer's current state
    pub fn state(&self, producer_id: ProducerId) -> Option<ProducerState> {
        self.producers.get(&producer_id).map(|e| e.state.lock().clone())
    }

    pub fn status(&self, producer_id: ProducerId) -> Option<ProducerStatus> {
        self.producers.get(&producer_id).map(|e| e.state.lock().status)
    }

    pub fn is_enabled(&self, producer_id: ProducerId) -> bool {
        self.producers
            .get(&producer_id)
            .is_some_and(|e| e.state.lock().enabled)
    }

    pub fn is_available(&self, producer_id: ProducerId) -> bool {
        self.producers
            .get(&producer_id)
            .is_some_and(|e| e.state.lock().available)
    }

    pub fn set_enabled(&self, producer_id: ProducerId, enabled: bool) -> Result<()> {
        let entry = self.entry(producer_id)?;
        entry.state.lock().enabled = enabled;
        info!(producer_id, enabled, "Producer enablement changed");
        Ok(())
    }

    /// Seed the timestamp the next recovery starts from.
    ///
    /// Only allowed while the producer is not up; an operator may move the
    /// value backwards.
    pub fn set_recovery_from(&self, producer_id: ProducerId, timestamp: DateTime<Utc>) -> Result<()> {
        let entry = self.entry(producer_id)?;
        {
            let mut state = entry.state.lock();
            if state.status == ProducerStatus::Up {
                return Err(FeedError::InvalidState(format!(
                    "producer {} is up, recovery timestamp can not be changed",
                    producer_id
                )));
            }
            state.last_timestamp_before_disconnect = Some(timestamp);
        }
        self.dirty.store(true, Ordering::SeqCst);
        info!(producer_id, %timestamp, "Recovery timestamp set");
        Ok(())
    }

    /// Run `f` under the producer's lock
    pub(crate) fn with_state<R>(
        &self,
        producer_id: ProducerId,
        f: impl FnOnce(&ProducerInfo, TimeDelta, &mut ProducerState) -> R,
    ) -> Option<R> {
        let entry = self.producers.get(&producer_id)?;
        let mut state = entry.state.lock();
        Some(f(&entry.info, entry.inactivity_threshold, &mut state))
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Persist timestamps if any changed since the last flush
    pub fn flush_timestamps(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let timestamps: ProducerTimestamps = self
            .producers
            .iter()
            .filter_map(|(id, e)| e.state.lock().last_timestamp_before_disconnect.map(|ts| (*id, ts)))
            .collect();

        if let Err(e) = self.store.save(&timestamps) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(true)
    }

    fn entry(&self, producer_id: ProducerId) -> Result<&ProducerEntry> {
        self.producers
            .get(&producer_id)
            .ok_or(FeedError::UnknownProducer(producer_id))
    }
}

fn seconds(secs: u64) -> TimeDelta {
    TimeDelta::from_std(Duration::from_secs(secs)).unwrap_or(TimeDelta::MAX)
}
