//! Upstream event broadcasting.
//!
//! Events fan out to any number of subscribers (SSE clients, the CLI's log
//! printer, tests) through a bounded broadcast channel. Slow subscribers
//! lag and skip events; emitters never block.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;
use upmux_core::{EventEmitter, UpstreamEvent};

/// Broadcast channel capacity for upstream events.
pub const CHANNEL_CAPACITY: usize = 64;

/// Broadcaster for upstream lifecycle events.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<UpstreamEvent>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Broadcast an event to all subscribers.
    pub fn broadcast(&self, event: UpstreamEvent) {
        if self.sender.receiver_count() > 0 {
            debug!(event = event.name(), server = ?event.server(), "Broadcasting upstream event");
            let _ = self.sender.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter for EventBroadcaster {
    fn emit(&self, event: UpstreamEvent) {
        self.broadcast(event);
    }

    fn clone_box(&self) -> Box<dyn EventEmitter> {
        Box::new(self.clone())
    }
}
