//! Persisted OAuth token storage, keyed by server name.
//!
//! Only the OAuth refresh manager and the actor's OAuth path touch this
//! port. The supervisor and the state view never do.

use async_trait::async_trait;

use crate::domain::OAuthToken;
use crate::error::TokenStoreError;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save_token(&self, server: &str, token: &OAuthToken) -> Result<(), TokenStoreError>;

    async fn get_token(&self, server: &str) -> Result<Option<OAuthToken>, TokenStoreError>;

    /// Delete a token. Deleting a missing token is not an error.
    async fn delete_token(&self, server: &str) -> Result<(), TokenStoreError>;

    /// Every stored `(server, token)` pair, used to resume refresh schedules.
    async fn list_tokens(&self) -> Result<Vec<(String, OAuthToken)>, TokenStoreError>;
}
