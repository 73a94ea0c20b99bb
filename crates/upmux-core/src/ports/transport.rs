//! Transport ports: how an actor dials an upstream and talks to it.
//!
//! Transport variants form a small closed set ([`TransportKind`]). An actor
//! picks one from the [`TransportFactory`] when it is built and again only if
//! its config changes kind.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ServerConfig, ToolInfo, TransportKind};
use crate::error::TransportError;

/// An established connection to one upstream.
#[async_trait]
pub trait Session: Send + Sync {
    /// Fetch the full tool list (following pagination).
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError>;

    /// Whether the underlying connection still looks usable.
    fn is_alive(&self) -> bool;

    /// Close the connection. Idempotent.
    async fn close(&mut self);
}

/// Dials upstreams of one transport kind.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Connect and complete the `initialize` handshake.
    ///
    /// Returns [`TransportError::Unauthorized`] when the upstream demands
    /// OAuth credentials the caller did not supply.
    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Session>, TransportError>;
}

/// Selects the transport variant for a server.
pub trait TransportFactory: Send + Sync {
    fn transport_for(&self, kind: TransportKind) -> Arc<dyn Transport>;
}
