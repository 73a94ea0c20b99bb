//! Runtime for the upmux control plane.
//!
//! - [`supervisor`]: reconciles config snapshots against the actor pool
//! - [`actor`]: one state machine per upstream server
//! - [`stateview`]: lock-free status map for external readers
//! - [`oauth`]: interactive login, discovery and proactive token refresh
//! - [`sandbox`]: docker isolation and label-based cleanup
#![deny(unused_crate_dependencies)]

pub mod actor;
pub mod config_watch;
pub mod error;
pub mod events;
pub mod oauth;
pub mod sandbox;
pub mod stateview;
pub mod supervisor;
pub mod token_store;

pub use actor::{ActorHandle, ActorSettings, StopOutcome};
pub use config_watch::{ConfigFileWatcher, DEFAULT_POLL_INTERVAL, FileFingerprint};
pub use error::{ConnectFailure, SupervisorError};
pub use events::EventBroadcaster;
pub use oauth::{
    Authenticator, OAuthClient, OAuthFlowCoordinator, RefreshExecutor, RefreshManager,
    RefreshNotice, RefreshState, TokenRefresher,
};
pub use sandbox::{DockerSandbox, instance_file, load_or_create_instance_id};
pub use stateview::{StateSnapshot, StateView};
pub use supervisor::{
    ActionKind, ReconcilePlan, ShutdownReport, Supervisor, SupervisorDeps, SupervisorSettings,
};
pub use token_store::{FileTokenStore, MemoryTokenStore};

#[cfg(test)]
use mockall as _;
#[cfg(test)]
use tokio_test as _;
#[cfg(test)]
use wiremock as _;
