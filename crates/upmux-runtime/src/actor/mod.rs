//! Connection actors.
//!
//! One actor owns one upstream: its transport session, its sandbox
//! container and its slice of the state view. The supervisor talks to it
//! only through an [`ActorHandle`].
//!
//! The actor body runs in its own task under a small monitor task. If the
//! body panics the monitor publishes an `Error` status for that server and
//! marks the actor stopped; no other actor is affected.
//!
//! A ready actor re-lists tools every health-check interval. A dead session
//! or an exited sandbox container turns into a connect failure, so the
//! usual backoff and retry path takes over.

mod command;
mod handle;
mod machine;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::error;
use upmux_core::{
    BackoffPolicy, ConnectionStatus, DockerIsolationDefaults, EventEmitter, Sandbox, ServerConfig,
    TokenStore, TransportFactory, UpstreamEvent,
};

pub use command::{ActorCommand, COMMAND_BUFFER, StopOutcome};
pub use handle::ActorHandle;
use machine::{Machine, initial_status};

use crate::oauth::{Authenticator, RefreshManager};
use crate::stateview::StateView;

/// Default bound on one dial or tool listing.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a ready actor re-lists tools to confirm the upstream is alive.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Tunables shared by every actor.
#[derive(Debug, Clone, Copy)]
pub struct ActorSettings {
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            backoff: BackoffPolicy::CONNECTION,
        }
    }
}

/// Everything an actor needs from the outside world.
#[derive(Clone)]
pub struct ActorDeps {
    pub transports: Arc<dyn TransportFactory>,
    pub tokens: Arc<dyn TokenStore>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    /// Isolation defaults from the latest applied config.
    pub isolation: Arc<ArcSwap<DockerIsolationDefaults>>,
    pub state: Arc<StateView>,
    pub events: Arc<dyn EventEmitter>,
    pub refresh: Option<Arc<RefreshManager>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub settings: ActorSettings,
}

/// A connection actor that has not been started yet.
pub struct Actor {
    config: Arc<ServerConfig>,
    epoch: u64,
    deps: ActorDeps,
}

impl Actor {
    pub fn new(config: Arc<ServerConfig>, epoch: u64, deps: ActorDeps) -> Self {
        Self {
            config,
            epoch,
            deps,
        }
    }

    /// Spawn the actor. Cancelling `parent` stops it.
    pub fn start(self, parent: &CancellationToken) -> ActorHandle {
        let Self {
            config,
            epoch,
            deps,
        } = self;
        let name = config.name.clone();
        let cancel = parent.child_token();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let status = initial_status(&config);
        deps.state.publish_as(epoch, status.clone());
        let (status_tx, status_rx) = watch::channel(status.clone());
        let (done_tx, done_rx) = watch::channel(false);

        let state = Arc::clone(&deps.state);
        let events = Arc::clone(&deps.events);
        let panic_status = status_tx.clone();

        let machine = Machine::new(config, epoch, deps, status, status_tx, cancel.clone());
        let body = tokio::spawn(machine.run(command_rx));
        let abort = body.abort_handle();

        let monitor_name = name.clone();
        tokio::spawn(async move {
            if let Err(e) = body.await
                && e.is_panic()
            {
                error!(server = %monitor_name, epoch, "Connection actor panicked");
                let mut status = panic_status.borrow().clone();
                let from = status.status();
                status.connection.status = ConnectionStatus::Error;
                status.connection.should_retry = false;
                status.set_error("actor panicked");
                status.clear_tools();
                status.updated_at = chrono::Utc::now();
                state.publish_as(epoch, status.clone());
                panic_status.send_replace(status);
                events.emit(UpstreamEvent::state_changed(
                    monitor_name,
                    from,
                    ConnectionStatus::Error,
                    Some("actor panicked".to_string()),
                ));
            }
            done_tx.send_replace(true);
        });

        ActorHandle {
            name,
            epoch,
            commands: command_tx,
            status: status_rx,
            done: done_rx,
            cancel,
            abort,
        }
    }
}
