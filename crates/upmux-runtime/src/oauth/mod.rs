//! OAuth for upstream servers.
//!
//! - [`client`]: interactive authorization-code + PKCE flow and refresh grant
//! - [`refresh`]: proactive refresh scheduling with bounded retries
//! - [`coordinator`]: one interactive flow per server
//! - [`discovery`], [`pkce`], [`callback`]: flow building blocks

use async_trait::async_trait;
use upmux_core::{AuthError, OAuthToken, ServerConfig};

pub mod callback;
pub mod client;
pub mod coordinator;
pub mod discovery;
pub mod pkce;
pub mod refresh;
pub mod refresher;

pub use client::{BrowserOpener, OAuthClient, SystemBrowser};
pub use coordinator::{FlowGuard, OAuthFlowCoordinator};
pub use refresh::{
    RefreshExecutor, RefreshManager, RefreshNotice, RefreshState, RefreshStateInfo, StartReport,
    compute_refresh_delay,
};
pub use refresher::TokenRefresher;

/// Obtains a fresh token interactively and persists it.
///
/// `resource_metadata` is the RFC 9728 hint from a 401, if any.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        server: &ServerConfig,
        resource_metadata: Option<&str>,
    ) -> Result<OAuthToken, AuthError>;
}
