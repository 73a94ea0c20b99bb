//! CLI-specific error types and exit codes.

use thiserror::Error;
use upmux_core::{AuthError, ConfigError, ResourceError, TransportError};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("{0}")]
    Runtime(String),
}

impl CliError {
    /// Map error to an exit code (see sysexits.h).
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 78,       // EX_CONFIG
            Self::Auth(_) => 77,         // EX_NOPERM
            Self::Sandbox(_) => 69,      // EX_UNAVAILABLE
            Self::UnknownServer(_) => 2, // EX_USAGE
            Self::Runtime(_) => 1,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ServerNotFound(name) => Self::UnknownServer(name),
            other => Self::Config(other.to_string()),
        }
    }
}

impl From<AuthError> for CliError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::ServerNotFound(name) => Self::UnknownServer(name),
            other => Self::Auth(other.to_string()),
        }
    }
}

impl From<ResourceError> for CliError {
    fn from(err: ResourceError) -> Self {
        Self::Sandbox(err.to_string())
    }
}

impl From<TransportError> for CliError {
    fn from(err: TransportError) -> Self {
        Self::Runtime(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_server_is_usage_error() {
        let err = CliError::from(ConfigError::ServerNotFound("x".into()));
        assert!(matches!(err, CliError::UnknownServer(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_auth_errors_map_to_noperm() {
        let err = CliError::from(AuthError::InvalidGrant("revoked".into()));
        assert_eq!(err.exit_code(), 77);
        assert!(err.to_string().contains("revoked"));
    }
}
