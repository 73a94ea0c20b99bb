//! At most one interactive OAuth flow per server.
//!
//! A flow is claimed with [`OAuthFlowCoordinator::try_begin`] and released
//! when the returned guard drops. A claim older than the stale timeout is
//! assumed abandoned (browser closed, process killed mid-flow) and may be
//! taken over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;
use upmux_core::AuthError;

/// Flows older than this are treated as abandoned.
pub const STALE_FLOW_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct ActiveFlow {
    id: u64,
    started: Instant,
}

#[derive(Debug, Default)]
struct Flows {
    next_id: u64,
    active: HashMap<String, ActiveFlow>,
}

/// Tracks which servers have an interactive flow in progress.
#[derive(Debug)]
pub struct OAuthFlowCoordinator {
    flows: Mutex<Flows>,
    stale_after: Duration,
}

impl Default for OAuthFlowCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuthFlowCoordinator {
    pub fn new() -> Self {
        Self::with_stale_timeout(STALE_FLOW_TIMEOUT)
    }

    pub fn with_stale_timeout(stale_after: Duration) -> Self {
        Self {
            flows: Mutex::new(Flows::default()),
            stale_after,
        }
    }

    /// Claim the flow slot for `server`.
    pub fn try_begin(self: &Arc<Self>, server: &str) -> Result<FlowGuard, AuthError> {
        let mut flows = self
            .flows
            .lock()
            .map_err(|_| AuthError::Other("flow coordinator lock poisoned".to_string()))?;

        if let Some(existing) = flows.active.get(server) {
            let age = existing.started.elapsed();
            if age < self.stale_after {
                return Err(AuthError::FlowInProgress(server.to_string()));
            }
            warn!(server = %server, age_secs = age.as_secs(), "Replacing stale OAuth flow");
        }

        flows.next_id += 1;
        let id = flows.next_id;
        flows.active.insert(
            server.to_string(),
            ActiveFlow {
                id,
                started: Instant::now(),
            },
        );

        Ok(FlowGuard {
            coordinator: Arc::clone(self),
            server: server.to_string(),
            id,
        })
    }

    /// Whether a non-stale flow is running for `server`.
    pub fn is_active(&self, server: &str) -> bool {
        self.flows.lock().is_ok_and(|flows| {
            flows
                .active
                .get(server)
                .is_some_and(|f| f.started.elapsed() < self.stale_after)
        })
    }

    fn release(&self, server: &str, id: u64) {
        if let Ok(mut flows) = self.flows.lock() {
            // A stale takeover may have replaced our entry.
            if flows.active.get(server).is_some_and(|f| f.id == id) {
                flows.active.remove(server);
            }
        }
    }
}

/// Holds a server's flow slot; dropping it ends the flow.
#[derive(Debug)]
pub struct FlowGuard {
    coordinator: Arc<OAuthFlowCoordinator>,
    server: String,
    id: u64,
}

impl FlowGuard {
    pub fn server(&self) -> &str {
        &self.server
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.coordinator.release(&self.server, self.id);
    }
}
