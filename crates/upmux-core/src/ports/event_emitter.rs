//! Event emitter trait for supervisor and actor events.
//!
//! Implementations handle transport details (broadcast channels, SSE, logs).

use crate::events::UpstreamEvent;

/// Trait for emitting upstream lifecycle events.
///
/// # Implementations
///
/// - `NoopEmitter` - for tests and one-shot CLI commands
/// - `EventBroadcaster` in `upmux-runtime` - bounded broadcast channel
pub trait EventEmitter: Send + Sync {
    /// Emit an event. Must not block.
    fn emit(&self, event: UpstreamEvent);

    /// Clone this emitter into a boxed trait object.
    fn clone_box(&self) -> Box<dyn EventEmitter>;
}

/// An emitter that discards every event.
#[derive(Debug, Clone, Default)]
pub struct NoopEmitter;

impl NoopEmitter {
    pub const fn new() -> Self {
        Self
    }
}

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: UpstreamEvent) {}

    fn clone_box(&self) -> Box<dyn EventEmitter> {
        Box::new(self.clone())
    }
}
