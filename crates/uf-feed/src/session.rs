//! Session Router - fans parsed messages out to interested sessions
//!
//! Every session has its own unbounded queue, so a slow consumer never holds up
//! delivery to the others. A session sees a given message at most once even
//! when it arrives on several channels (overlapping interests bind the same
//! routing keys).

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use uf_common::{FeedMessageEnvelope, FeedPayload};

use crate::feed_metrics;
use crate::interest::MessageInterest;

pub type SessionId = u64;

/// Messages remembered per session for duplicate suppression
pub const DEFAULT_DEDUP_WINDOW: usize = 4096;

struct RecentMessages {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
    capacity: usize,
}

impl RecentMessages {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `fingerprint`; false if it was already present
    fn insert(&mut self, fingerprint: u64) -> bool {
        if !self.seen.insert(fingerprint) {
            return false;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

struct SessionEntry {
    name: String,
    interest: MessageInterest,
    sender: mpsc::UnboundedSender<Arc<FeedMessageEnvelope>>,
    recent: Mutex<RecentMessages>,
}

pub struct SessionRouter {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    next_id: AtomicU64,
    dedup_window: usize,
}

impl SessionRouter {
    pub fn new() -> Self {
        Self::with_dedup_window(DEFAULT_DEDUP_WINDOW)
    }

    pub fn with_dedup_window(dedup_window: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            dedup_window: dedup_window.max(1),
        }
    }

    /// Register a session; it receives matching messages until unregistered or
    /// until the receiver is dropped.
    pub fn register(
        &self,
        name: impl Into<String>,
        interest: MessageInterest,
    ) -> (SessionId, mpsc::UnboundedReceiver<Arc<FeedMessageEnvelope>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        let name = name.into();

        info!(session_id = id, session = %name, interest = %interest, "Session registered");
        self.sessions.insert(
            id,
            Arc::new(SessionEntry {
                name,
                interest,
                sender,
                recent: Mutex::new(RecentMessages::new(self.dedup_window)),
            }),
        );
        feed_metrics::set_session_count(self.sessions.len());

        (id, receiver)
    }

    pub fn unregister(&self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id);
        feed_metrics::set_session_count(self.sessions.len());
        if let Some((_, entry)) = &removed {
            info!(session_id = id, session = %entry.name, "Session unregistered");
        }
        removed.is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Deliver `envelope` to every matching session; returns how many got it
    pub fn dispatch(&self, envelope: &Arc<FeedMessageEnvelope>) -> usize {
        let targets: Vec<(SessionId, Arc<SessionEntry>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().interest.matches(envelope))
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        if targets.is_empty() {
            return 0;
        }

        let fingerprint = fingerprint(envelope);
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, session) in targets {
            if !session.recent.lock().insert(fingerprint) {
                debug!(session = %session.name, routing_key = %envelope.routing_key, "Duplicate message suppressed");
                continue;
            }
            if session.sender.send(envelope.clone()).is_err() {
                closed.push(id);
                continue;
            }
            feed_metrics::record_session_dispatch(&session.name);
            delivered += 1;
        }

        for id in closed {
            debug!(session_id = id, "Session receiver dropped, removing session");
            self.unregister(id);
        }

        delivered
    }
}

impl Default for SessionRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a published message; equal for copies arriving on different queues
fn fingerprint(envelope: &FeedMessageEnvelope) -> u64 {
    let mut hasher = DefaultHasher::new();
    envelope.producer_id.hash(&mut hasher);
    envelope.kind.hash(&mut hasher);
    envelope.event_id.hash(&mut hasher);
    envelope.generated_at.timestamp_millis().hash(&mut hasher);
    envelope.request_id.hash(&mut hasher);
    envelope.routing_key.hash(&mut hasher);
    match &envelope.payload {
        FeedPayload::Alive { subscribed } => subscribed.hash(&mut hasher),
        FeedPayload::SnapshotComplete => {}
        // Distinct messages can share every field above within one millisecond
        FeedPayload::Event(body) => {
            if let Ok(bytes) = serde_json::to_vec(body) {
                bytes.hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}
