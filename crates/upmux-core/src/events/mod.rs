//! Canonical event union for upstream lifecycle events.
//!
//! # Wire Format
//!
//! Events are serialized with a dotted `type` tag:
//!
//! ```json
//! { "type": "server.connected", "server": "svc-a", "toolCount": 12 }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ConnectionStatus;

/// Action counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub connect: usize,
    pub reconnect: usize,
    pub disconnect: usize,
    pub remove: usize,
    pub unchanged: usize,
}

impl ReconcileCounts {
    /// Number of actions that actually do something.
    pub const fn changed(&self) -> usize {
        self.connect + self.reconnect + self.disconnect + self.remove
    }
}

/// Events emitted by the supervisor, actors and the refresh manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamEvent {
    /// A server appeared in the desired config.
    #[serde(rename = "server.added")]
    ServerAdded { server: String },

    /// A server was dropped from the desired config and its actor torn down.
    #[serde(rename = "server.removed")]
    ServerRemoved { server: String },

    /// A server's config changed.
    #[serde(rename = "server.updated")]
    ServerUpdated { server: String },

    #[serde(rename = "server.connected")]
    ServerConnected {
        server: String,
        #[serde(rename = "toolCount")]
        tool_count: usize,
    },

    #[serde(rename = "server.disconnected")]
    ServerDisconnected {
        server: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Any connection status transition.
    #[serde(rename = "server.state_changed")]
    ServerStateChanged {
        server: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "reconciliation.complete")]
    ReconciliationComplete {
        version: u64,
        counts: ReconcileCounts,
    },

    #[serde(rename = "reconciliation.failed")]
    ReconciliationFailed { version: u64, error: String },

    #[serde(rename = "oauth.token_refreshed")]
    TokenRefreshed {
        server: String,
        #[serde(
            rename = "expiresAt",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        expires_at: Option<DateTime<Utc>>,
    },

    /// Terminal refresh failure; emitted once per failed schedule.
    #[serde(rename = "oauth.refresh_failed")]
    RefreshFailed {
        server: String,
        error: String,
        class: String,
        attempts: u32,
    },
}

impl UpstreamEvent {
    pub fn server_added(server: impl Into<String>) -> Self {
        Self::ServerAdded {
            server: server.into(),
        }
    }

    pub fn server_removed(server: impl Into<String>) -> Self {
        Self::ServerRemoved {
            server: server.into(),
        }
    }

    pub fn server_updated(server: impl Into<String>) -> Self {
        Self::ServerUpdated {
            server: server.into(),
        }
    }

    pub fn state_changed(
        server: impl Into<String>,
        from: ConnectionStatus,
        to: ConnectionStatus,
        error: Option<String>,
    ) -> Self {
        Self::ServerStateChanged {
            server: server.into(),
            from,
            to,
            error,
        }
    }

    /// The dotted event name used on the wire.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ServerAdded { .. } => "server.added",
            Self::ServerRemoved { .. } => "server.removed",
            Self::ServerUpdated { .. } => "server.updated",
            Self::ServerConnected { .. } => "server.connected",
            Self::ServerDisconnected { .. } => "server.disconnected",
            Self::ServerStateChanged { .. } => "server.state_changed",
            Self::ReconciliationComplete { .. } => "reconciliation.complete",
            Self::ReconciliationFailed { .. } => "reconciliation.failed",
            Self::TokenRefreshed { .. } => "oauth.token_refreshed",
            Self::RefreshFailed { .. } => "oauth.refresh_failed",
        }
    }

    /// The server this event concerns, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::ServerAdded { server }
            | Self::ServerRemoved { server }
            | Self::ServerUpdated { server }
            | Self::ServerConnected { server, .. }
            | Self::ServerDisconnected { server, .. }
            | Self::ServerStateChanged { server, .. }
            | Self::TokenRefreshed { server, .. }
            | Self::RefreshFailed { server, .. } => Some(server),
            Self::ReconciliationComplete { .. } | Self::ReconciliationFailed { .. } => None,
        }
    }
}
