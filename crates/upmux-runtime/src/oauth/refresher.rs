//! Refresh executor backed by the OAuth client and the live config.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use upmux_core::{AuthError, ConfigSource, OAuthToken, TokenStore};

use super::client::OAuthClient;
use super::refresh::RefreshExecutor;

/// Runs the refresh-token grant for servers in the current config.
pub struct TokenRefresher {
    client: Arc<OAuthClient>,
    tokens: Arc<dyn TokenStore>,
    config: Arc<dyn ConfigSource>,
}

impl TokenRefresher {
    pub fn new(
        client: Arc<OAuthClient>,
        tokens: Arc<dyn TokenStore>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            client,
            tokens,
            config,
        }
    }
}

#[async_trait]
impl RefreshExecutor for TokenRefresher {
    async fn refresh(&self, server: &str) -> Result<OAuthToken, AuthError> {
        let config = self
            .config
            .find_server(server)
            .ok_or_else(|| AuthError::ServerNotFound(server.to_string()))?;
        if !config.uses_oauth() {
            return Err(AuthError::NotOAuth(server.to_string()));
        }
        let current = self
            .tokens
            .get_token(server)
            .await?
            .ok_or_else(|| AuthError::LoginRequired(server.to_string()))?;

        let token = self.client.exchange_refresh_token(&config, &current).await?;
        self.tokens.save_token(server, &token).await?;
        debug!(server = %server, expires_at = ?token.expires_at, "Refreshed token persisted");
        Ok(token)
    }
}
