//! Runtime status types published by connection actors.
//!
//! `ServerStatus` is the read-optimized denormalization external readers see.
//! Values are built by the owning actor and never mutated once published.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of a published error message.
pub const MAX_ERROR_LEN: usize = 500;

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Truncate an error message for publication.
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MAX_ERROR_LEN).collect();
    out.push_str(TRUNCATION_SUFFIX);
    out
}

/// Connection lifecycle status of one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Error,
    Stopped,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Authenticating => "Authenticating",
            Self::Ready => "Ready",
            Self::Error => "Error",
            Self::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Connection state owned by an actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    /// A retry is scheduled by the backoff policy.
    pub should_retry: bool,
}

/// OAuth status for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthStatus {
    #[default]
    None,
    Authenticating,
    Authenticated,
    Expired,
    Error,
}

impl fmt::Display for OAuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Expired => "expired",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// OAuth state owned by an actor (present only for OAuth servers).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub status: OAuthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Sticky: set by explicit logout, cleared only by explicit login.
    pub user_logged_out: bool,
    pub has_refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A cached tool definition captured at the last successful list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolInfo {
    /// Create a tool with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }
}

/// Status of one upstream as published into the state view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub enabled: bool,
    pub quarantined: bool,
    pub connection: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthState>,
    pub tool_count: usize,
    pub tools: Vec<ToolInfo>,
    pub updated_at: DateTime<Utc>,
}

impl ServerStatus {
    /// A fresh, disconnected status for a server.
    pub fn new(name: impl Into<String>, enabled: bool, quarantined: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
            quarantined,
            connection: ConnectionState::default(),
            oauth: None,
            tool_count: 0,
            tools: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Current connection status.
    pub const fn status(&self) -> ConnectionStatus {
        self.connection.status
    }

    /// Whether the server is connected and ready.
    pub const fn is_ready(&self) -> bool {
        matches!(self.connection.status, ConnectionStatus::Ready)
    }

    /// Replace the tool cache.
    pub fn set_tools(&mut self, tools: Vec<ToolInfo>) {
        self.tool_count = tools.len();
        self.tools = tools;
    }

    /// Drop the tool cache (on disconnect).
    pub fn clear_tools(&mut self) {
        self.tool_count = 0;
        self.tools.clear();
    }

    /// Record an error, truncating long messages.
    pub fn set_error(&mut self, message: &str) {
        self.connection.last_error = Some(truncate_error(message));
    }
}
