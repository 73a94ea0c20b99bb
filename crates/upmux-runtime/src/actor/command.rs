//! Messages accepted by a connection actor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use upmux_core::ServerConfig;

/// Mailbox capacity per actor.
pub const COMMAND_BUFFER: usize = 32;

#[derive(Debug)]
pub enum ActorCommand {
    /// Mark the server desired-up and connect if not already.
    Connect,
    /// Mark the server desired-down and tear the connection down.
    Disconnect,
    /// Swap in a new config for the same server name.
    UpdateConfig(Arc<ServerConfig>),
    /// Explicit user login: clears the logout flag and forces the OAuth flow.
    Login,
    /// Explicit user logout: sticky until the next `Login`.
    Logout,
    /// The refresh manager gave up on this server's token.
    AuthFailed { error: String },
    /// The refresh manager stored a new token.
    TokenRefreshed { expires_at: Option<DateTime<Utc>> },
}

/// Result of [`ActorHandle::stop`](super::ActorHandle::stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Transport closed and sandbox released.
    Stopped,
    /// The actor did not finish within the timeout.
    TimedOut,
}
