//! Fan-out of observable feed events
//!
//! Events are broadcast; a subscriber that falls behind by more than the
//! channel capacity skips the oldest events.

use tokio::sync::broadcast;
use tracing::trace;

use uf_common::FeedEvent;

pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

#[derive(Clone)]
pub struct FeedEventBus {
    tx: broadcast::Sender<FeedEvent>,
}

impl FeedEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; with none the event is dropped
    pub fn publish(&self, event: FeedEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            trace!(event = name, "No event subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FeedEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
