//! Recovery Coordinator - producer liveness and recovery orchestration
//!
//! Per producer: `Down -> Starting (recovery issued) -> Up (snapshot complete)`,
//! `Up -> Down` when alives stop (or `subscribed=0`), and `Starting -> Down`
//! when a recovery passes its deadline, after which it is re-issued.
//!
//! At most one recovery is outstanding per producer, and attempts are spaced
//! by at least `min_interval`. The request is recorded before the API call is
//! made, so a snapshot-complete can finish it while the call is in flight.
//! API calls run as their own tasks and never hold up message processing or
//! the sweep. A failed call rolls the producer back to where it was; the next
//! sweep or alive retries it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use uf_common::{
    FeedEvent, FeedMessageEnvelope, FeedPayload, ProducerDownReason, ProducerId, ProducerInfo,
    ProducerStatus, RequestId,
};
use uf_config::ProducerSettings;

use crate::events::FeedEventBus;
use crate::feed_metrics;
use crate::producer::{ProducerRegistry, ProducerState, RecoveryRequest};
use crate::Result;

/// Issues recovery requests to the upstream API
#[async_trait]
pub trait RecoveryIssuer: Send + Sync {
    /// Allocate the id the next request is sent with
    fn next_request_id(&self) -> RequestId;

    /// Ask for every message after `after`
    async fn issue_recovery(&self, producer: &ProducerInfo, request_id: RequestId, after: DateTime<Utc>) -> Result<()>;

    /// Ask for the complete current state
    async fn issue_full_snapshot(&self, producer: &ProducerInfo, request_id: RequestId) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub min_interval: TimeDelta,
    pub max_recovery_time: TimeDelta,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_interval: TimeDelta::seconds(30),
            max_recovery_time: TimeDelta::seconds(3600),
        }
    }
}

impl From<&ProducerSettings> for RecoveryConfig {
    fn from(settings: &ProducerSettings) -> Self {
        let delta = |secs: u64| TimeDelta::from_std(Duration::from_secs(secs)).unwrap_or(TimeDelta::MAX);
        Self {
            min_interval: delta(settings.min_interval_between_recovery_requests_secs),
            max_recovery_time: delta(settings.max_recovery_time_secs),
        }
    }
}

pub struct RecoveryCoordinator {
    registry: Arc<ProducerRegistry>,
    issuer: Arc<dyn RecoveryIssuer>,
    events: FeedEventBus,
    config: RecoveryConfig,
    /// API calls in flight, at most one per producer
    in_flight: Mutex<HashMap<ProducerId, JoinHandle<()>>>,
}

/// What a sweep decided for one producer
enum SweepAction {
    None,
    Issue,
}

/// A recovery recorded in the producer state whose API call is not made yet
struct ReservedRecovery {
    info: ProducerInfo,
    request_id: RequestId,
    after: Option<DateTime<Utc>>,
    previous_status: ProducerStatus,
}

impl RecoveryCoordinator {
    pub fn new(
        registry: Arc<ProducerRegistry>,
        issuer: Arc<dyn RecoveryIssuer>,
        events: FeedEventBus,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            registry,
            issuer,
            events,
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProducerRegistry> {
        &self.registry
    }

    /// Feed a parsed message into the state machine
    pub fn on_message(self: &Arc<Self>, envelope: &FeedMessageEnvelope, now: DateTime<Utc>) {
        match &envelope.payload {
            FeedPayload::Alive { subscribed } => self.on_alive(envelope.producer_id, *subscribed, now),
            FeedPayload::SnapshotComplete => {
                if let Some(request_id) = envelope.request_id {
                    self.on_snapshot_complete(envelope.producer_id, request_id, now);
                }
            }
            FeedPayload::Event(_) => {
                self.on_business_message(envelope.producer_id, envelope.generated_at, now)
            }
        }
    }

    /// An alive message arrived for `producer_id`
    pub fn on_alive(self: &Arc<Self>, producer_id: ProducerId, subscribed: bool, now: DateTime<Utc>) {
        let mut events = Vec::new();

        let needs_recovery = self
            .registry
            .with_state(producer_id, |_, _, state| {
                state.last_alive_at = Some(state.last_alive_at.map_or(now, |last| last.max(now)));
                state.suspended = false;
                state.available = true;

                if !subscribed && state.status != ProducerStatus::Down {
                    warn!(producer_id, "Producer reports it is not subscribed, marking it down");
                    mark_down(producer_id, state, ProducerDownReason::NotSubscribed, now, &mut events);
                }

                state.enabled && state.status == ProducerStatus::Down && !state.recovery_in_progress()
            })
            .unwrap_or(false);

        self.publish_all(events);

        if needs_recovery {
            self.spawn_issue(producer_id, now);
        }
    }
    /// A business message arrived; `generated_at` is its upstream generation time
    pub fn on_business_message(&self, producer_id: ProducerId, generated_at: DateTime<Utc>, now: DateTime<Utc>) {
        let advanced = self
            .registry
            .with_state(producer_id, |_, _, state| {
                state.last_message_at = Some(now);
                if !state.suspended {
                    state.available = true;
                }

                // Only messages received in sync count as processed
                if state.status != ProducerStatus::Up {
                    return false;
                }
                match state.last_timestamp_before_disconnect {
                    Some(last) if last >= generated_at => false,
                    _ => {
                        state.last_timestamp_before_disconnect = Some(generated_at);
                        true
                    }
                }
            })
            .unwrap_or(false);

        if advanced {
            self.registry.mark_dirty();
        }
    }

    /// A snapshot-complete message arrived; returns whether it finished the
    /// outstanding recovery.
    pub fn on_snapshot_complete(&self, producer_id: ProducerId, request_id: RequestId, now: DateTime<Utc>) -> bool {
        let mut events = Vec::new();

        let completed = self
            .registry
            .with_state(producer_id, |_, _, state| {
                let matches = state
                    .recovery
                    .as_ref()
                    .is_some_and(|r| r.request_id == request_id);
                if !matches {
                    debug!(
                        producer_id,
                        request_id,
                        outstanding = ?state.recovery.as_ref().map(|r| r.request_id),
                        "Ignoring snapshot complete for a request that is not outstanding"
                    );
                    return None;
                }

                let mut request = state.recovery.take()?;
                request.completed = true;

                state.last_timestamp_before_disconnect = Some(
                    state
                        .last_timestamp_before_disconnect
                        .map_or(request.issued_at, |ts| ts.max(request.issued_at)),
                );

                let was_up = state.status == ProducerStatus::Up;
                state.status = ProducerStatus::Up;
                state.down_reason = None;

                events.push(FeedEvent::RecoveryCompleted {
                    request_id,
                    producer_id,
                    event_id: None,
                });
                if !was_up {
                    events.push(FeedEvent::ProducerStatusChanged {
                        producer_id,
                        is_up: true,
                        reason: None,
                        at: now,
                    });
                }
                Some(request)
            })
            .flatten();

        let Some(request) = completed else {
            return false;
        };

        self.registry.mark_dirty();
        feed_metrics::record_recovery_completed(
            producer_id,
            (now - request.issued_at).to_std().unwrap_or_default(),
        );
        feed_metrics::set_producer_up(producer_id, true);
        info!(
            producer_id,
            request_id,
            took_secs = (now - request.issued_at).num_seconds(),
            "Recovery completed, producer is up"
        );

        self.publish_all(events);
        true
    }

    /// Check every producer for alive timeouts, expired recoveries and
    /// recoveries that still need to be issued.
    pub fn sweep(self: &Arc<Self>, now: DateTime<Utc>) {
        for producer_id in self.registry.ids() {
            let mut events = Vec::new();

            let action = self
                .registry
                .with_state(producer_id, |_, threshold, state| {
                    if !state.enabled {
                        return SweepAction::None;
                    }
                    let alive_recent = state.last_alive_at.is_some_and(|at| now - at <= threshold);

                    if state.status != ProducerStatus::Down && !alive_recent {
                        warn!(
                            producer_id,
                            last_alive_at = ?state.last_alive_at,
                            threshold_secs = threshold.num_seconds(),
                            "No alive within the inactivity threshold, marking producer down"
                        );
                        mark_down(producer_id, state, ProducerDownReason::AliveIntervalViolation, now, &mut events);
                        return SweepAction::None;
                    }

                    if let Some(request) = state.recovery.as_ref().filter(|r| now > r.deadline) {
                        warn!(
                            producer_id,
                            request_id = request.request_id,
                            issued_at = %request.issued_at,
                            "Recovery passed its deadline, re-issuing"
                        );
                        feed_metrics::record_recovery_timed_out(producer_id);
                        state.recovery = None;
                        state.status = ProducerStatus::Down;
                        state.down_reason = Some(ProducerDownReason::RecoveryTimeout);
                    }

                    if state.status == ProducerStatus::Down && alive_recent && !state.recovery_in_progress() {
                        SweepAction::Issue
                    } else {
                        SweepAction::None
                    }
                })
                .unwrap_or(SweepAction::None);

            self.publish_all(events);

            if let SweepAction::Issue = action {
                self.spawn_issue(producer_id, now);
            }
        }
    }

    /// Issue a recovery unless one is outstanding or the last attempt was too
    /// recent, waiting for the API call. Returns the request id of an accepted
    /// request.
    pub async fn try_issue(&self, producer_id: ProducerId, now: DateTime<Utc>) -> Option<RequestId> {
        let reserved = self.reserve(producer_id, now)?;
        let request_id = reserved.request_id;
        self.send(reserved).await.then_some(request_id)
    }

    /// Like [`try_issue`](Self::try_issue), but the API call runs on its own
    /// task. The request is recorded before this returns.
    pub fn spawn_issue(self: &Arc<Self>, producer_id: ProducerId, now: DateTime<Utc>) -> Option<RequestId> {
        let reserved = self.reserve(producer_id, now)?;
        let request_id = reserved.request_id;

        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            coordinator.send(reserved).await;
        });

        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|_, task| !task.is_finished());
        in_flight.insert(producer_id, handle);
        Some(request_id)
    }

    /// Wait until every recovery call in flight has finished
    pub async fn wait_for_requests(&self) {
        loop {
            let tasks: Vec<_> = self.in_flight.lock().drain().map(|(_, task)| task).collect();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Recovery request task failed");
                    }
                }
            }
        }
    }

    /// Abandon every recovery call in flight
    pub fn abort_requests(&self) {
        let tasks: Vec<_> = self.in_flight.lock().drain().map(|(_, task)| task).collect();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Aborting recovery requests in flight");
        }
        for task in tasks {
            task.abort();
        }
    }

    /// Record a new outstanding recovery under the producer lock
    fn reserve(&self, producer_id: ProducerId, now: DateTime<Utc>) -> Option<ReservedRecovery> {
        let min_interval = self.config.min_interval;
        let deadline = now
            .checked_add_signed(self.config.max_recovery_time)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.registry
            .with_state(producer_id, |info, _, state| {
                if !state.enabled || state.recovery_in_progress() {
                    return None;
                }
                if let Some(last) = state.last_recovery_attempt_at {
                    if now - last < min_interval {
                        debug!(
                            producer_id,
                            last_attempt = %last,
                            "Recovery attempted too recently, waiting"
                        );
                        return None;
                    }
                }

                let request_id = self.issuer.next_request_id();
                let after = state
                    .last_timestamp_before_disconnect
                    .map(|ts| clamp_to_window(info, ts, now));
                let previous_status = state.status;

                state.issuing = true;
                state.last_recovery_attempt_at = Some(now);
                state.recovery = Some(RecoveryRequest {
                    request_id,
                    producer_id,
                    after,
                    issued_at: now,
                    deadline,
                    completed: false,
                });
                state.status = ProducerStatus::Starting;

                Some(ReservedRecovery {
                    info: info.clone(),
                    request_id,
                    after,
                    previous_status,
                })
            })
            .flatten()
    }

    /// Make the API call for a reserved recovery; returns whether it was accepted
    async fn send(&self, reserved: ReservedRecovery) -> bool {
        let ReservedRecovery {
            info,
            request_id,
            after,
            previous_status,
        } = reserved;
        let producer_id = info.id;

        let result = match after {
            Some(after) => self.issuer.issue_recovery(&info, request_id, after).await,
            None => self.issuer.issue_full_snapshot(&info, request_id).await,
        };

        let accepted = result.is_ok();
        self.registry.with_state(producer_id, |_, _, state| {
            state.issuing = false;
            // A snapshot-complete or a mark-down may already have replaced the request
            if !accepted && state.recovery.as_ref().is_some_and(|r| r.request_id == request_id) {
                state.recovery = None;
                state.status = previous_status;
            }
        });

        match result {
            Ok(()) => {
                feed_metrics::record_recovery_issued(producer_id, after.is_none());
                info!(
                    producer_id,
                    request_id,
                    after = ?after,
                    "Recovery requested"
                );
                self.events.publish(FeedEvent::RecoveryInitiated {
                    request_id,
                    producer_id,
                    after,
                });
                true
            }
            Err(e) => {
                feed_metrics::record_recovery_failed(producer_id);
                warn!(
                    producer_id,
                    request_id,
                    error = %e,
                    "Recovery request failed, will retry"
                );
                false
            }
        }
    }

    fn publish_all(&self, events: Vec<FeedEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }
}

/// Move `state` to Down; only an Up producer reports the change
fn mark_down(
    producer_id: ProducerId,
    state: &mut ProducerState,
    reason: ProducerDownReason,
    now: DateTime<Utc>,
    events: &mut Vec<FeedEvent>,
) {
    let was_up = state.status == ProducerStatus::Up;
    state.status = ProducerStatus::Down;
    state.down_reason = Some(reason);
    state.recovery = None;
    if reason == ProducerDownReason::AliveIntervalViolation {
        state.available = false;
        state.suspended = true;
    }

    if was_up {
        feed_metrics::set_producer_up(producer_id, false);
        events.push(FeedEvent::ProducerStatusChanged {
            producer_id,
            is_up: false,
            reason: Some(reason),
            at: now,
        });
    }
}

/// Recoveries can not reach further back than the producer's stateful window
fn clamp_to_window(info: &ProducerInfo, after: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let earliest = now - info.stateful_recovery_window();
    if after < earliest {
        warn!(
            producer_id = info.id,
            requested = %after,
            earliest = %earliest,
            "Recovery timestamp is outside the producer's recovery window, clamping"
        );
        earliest
    } else {
        after
    }
}
