//! Runtime error types.
//!
//! `ConnectFailure` is what a single connect attempt ends in; the actor uses
//! it to decide whether to schedule a retry. `SupervisorError` covers the
//! user-facing supervisor operations.

use thiserror::Error;
use upmux_core::{AuthError, ConfigError, ResourceError, TransportError};

/// Why a connect attempt failed.
#[derive(Debug, Error)]
pub enum ConnectFailure {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("connect timed out after {0}s")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,
}

impl ConnectFailure {
    /// Whether the backoff policy should schedule another attempt.
    ///
    /// Config errors and terminal auth errors wait for a human.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Cancelled => false,
            Self::Auth(err) => !err.is_terminal(),
            Self::Transport(_) | Self::Resource(_) | Self::Timeout(_) => true,
        }
    }
}

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no running actor for server '{0}'")]
    UnknownServer(String),

    #[error("actor for server '{0}' has stopped")]
    ActorGone(String),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ConnectFailure::Transport(TransportError::Closed).is_retryable());
        assert!(ConnectFailure::Timeout(30).is_retryable());
        assert!(
            ConnectFailure::Resource(ResourceError::Unavailable("no docker".into())).is_retryable()
        );
        assert!(ConnectFailure::Auth(AuthError::Network("reset".into())).is_retryable());

        assert!(!ConnectFailure::Auth(AuthError::InvalidGrant("revoked".into())).is_retryable());
        assert!(!ConnectFailure::Config(ConfigError::NoHomeDir).is_retryable());
        assert!(!ConnectFailure::Cancelled.is_retryable());
    }
}
