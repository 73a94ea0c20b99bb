//! Error taxonomy shared by all upstream-connection components.
//!
//! - `TransportError`: connect/IO failure, retryable
//! - `AuthError`: OAuth failure, retryable or terminal per [`AuthErrorClass`]
//! - `ConfigError`: invalid server definition, never retried
//! - `ResourceError`: sandbox failure, retryable like transport errors

use std::path::PathBuf;

use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Upstream answered 401; carries the RFC 9728 metadata hint if present.
    #[error("upstream requires authorization")]
    Unauthorized { resource_metadata: Option<String> },

    #[error("failed to spawn upstream process: {0}")]
    Spawn(String),

    #[error("I/O error talking to upstream: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON from upstream: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("upstream returned error: code={code}, message={message}")]
    Rpc { code: i64, message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout waiting for upstream")]
    Timeout,

    #[error("upstream closed the connection")]
    Closed,
}

/// Classification of an OAuth failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorClass {
    /// The server was removed or no longer uses OAuth.
    ServerGone,
    /// The refresh token is invalid, expired or revoked; a human must log in.
    InvalidGrant,
    /// Network trouble, worth retrying.
    Network,
    /// Anything else, retried.
    Other,
}

impl AuthErrorClass {
    /// Terminal classes stop retrying immediately.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ServerGone | Self::InvalidGrant)
    }

    /// Label used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerGone => "failed_server_gone",
            Self::InvalidGrant => "failed_invalid_grant",
            Self::Network => "failed_network",
            Self::Other => "failed_other",
        }
    }

    /// Classify a free-form error message.
    pub fn from_message(message: &str) -> Self {
        const SERVER_GONE: &[&str] = &["server not found", "server does not use oauth"];
        const INVALID_GRANT: &[&str] = &[
            "invalid_grant",
            "refresh token expired",
            "refresh token revoked",
            "refresh token invalid",
        ];
        const NETWORK: &[&str] = &[
            "timeout",
            "timed out",
            "connection refused",
            "connection reset",
            "no such host",
            "dns error",
            "dial tcp",
            "network",
            "eof",
            "deadline exceeded",
        ];

        let lower = message.to_lowercase();
        let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

        if has(SERVER_GONE) {
            Self::ServerGone
        } else if has(INVALID_GRANT) {
            Self::InvalidGrant
        } else if has(NETWORK) {
            Self::Network
        } else {
            Self::Other
        }
    }
}

/// OAuth failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server does not use OAuth: {0}")]
    NotOAuth(String),

    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    /// The user logged out or no refresh path exists; needs explicit login.
    #[error("login required for {0}")]
    LoginRequired(String),

    #[error("OAuth flow already in progress for {0}")]
    FlowInProgress(String),

    #[error("OAuth metadata discovery failed: {0}")]
    Discovery(String),

    #[error("dynamic client registration failed: {0}")]
    Registration(String),

    #[error("token endpoint returned {status}: {message}")]
    TokenEndpoint { status: u16, message: String },

    #[error("network error during OAuth: {0}")]
    Network(String),

    #[error("OAuth flow timed out")]
    Timeout,

    #[error("token storage error: {0}")]
    Storage(#[from] TokenStoreError),

    #[error("{0}")]
    Other(String),
}

impl AuthError {
    /// Classify this error for retry decisions.
    pub fn classify(&self) -> AuthErrorClass {
        match self {
            Self::ServerNotFound(_) | Self::NotOAuth(_) => AuthErrorClass::ServerGone,
            Self::InvalidGrant(_) | Self::LoginRequired(_) => AuthErrorClass::InvalidGrant,
            Self::Network(_) | Self::Timeout => AuthErrorClass::Network,
            Self::TokenEndpoint { message, .. } => AuthErrorClass::from_message(message),
            Self::Other(message) => AuthErrorClass::from_message(message),
            Self::FlowInProgress(_)
            | Self::Discovery(_)
            | Self::Registration(_)
            | Self::Storage(_) => AuthErrorClass::Other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.classify().is_terminal()
    }
}

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server '{name}': {reason}")]
    InvalidServer { name: String, reason: String },

    #[error("duplicate server name: {0}")]
    DuplicateServer(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("failed to read config {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("failed to write config {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("config service has no backing file")]
    NoBackingFile,

    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Sandbox resource failures.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),

    #[error("failed to start sandbox for {server}: {reason}")]
    StartFailed { server: String, reason: String },

    #[error("failed to stop container {container}: {reason}")]
    StopFailed { container: String, reason: String },

    #[error("`{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("sandbox operation timed out: {0}")]
    Timeout(String),

    #[error("container {container} is no longer running")]
    NotRunning { container: String },
}

/// Token persistence failures.
#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("token store I/O error: {0}")]
    Io(String),

    #[error("token store serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classes() {
        assert!(AuthError::InvalidGrant("revoked".into()).is_terminal());
        assert!(AuthError::ServerNotFound("svc".into()).is_terminal());
        assert!(AuthError::NotOAuth("svc".into()).is_terminal());
        assert!(AuthError::LoginRequired("svc".into()).is_terminal());
        assert!(!AuthError::Network("reset".into()).is_terminal());
        assert!(!AuthError::Timeout.is_terminal());
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(
            AuthErrorClass::from_message("oauth2: \"invalid_grant\" refresh token revoked"),
            AuthErrorClass::InvalidGrant
        );
        assert_eq!(
            AuthErrorClass::from_message("Server not found: svc-a"),
            AuthErrorClass::ServerGone
        );
        assert_eq!(
            AuthErrorClass::from_message("dial tcp 10.0.0.1:443: connection refused"),
            AuthErrorClass::Network
        );
        assert_eq!(
            AuthErrorClass::from_message("unexpected EOF"),
            AuthErrorClass::Network
        );
        assert_eq!(
            AuthErrorClass::from_message("something odd"),
            AuthErrorClass::Other
        );
    }

    #[test]
    fn test_token_endpoint_errors_classified_by_body() {
        let err = AuthError::TokenEndpoint {
            status: 400,
            message: "invalid_grant".into(),
        };
        assert_eq!(err.classify(), AuthErrorClass::InvalidGrant);

        let err = AuthError::TokenEndpoint {
            status: 503,
            message: "temporarily unavailable".into(),
        };
        assert_eq!(err.classify(), AuthErrorClass::Other);
    }
}
