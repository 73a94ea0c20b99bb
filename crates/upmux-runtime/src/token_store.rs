//! Token store implementations.
//!
//! - [`MemoryTokenStore`]: process-local, for tests and embedding
//! - [`FileTokenStore`]: a single JSON map on disk, rewritten atomically

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use upmux_core::{OAuthToken, TokenStore, TokenStoreError};

/// In-memory token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<BTreeMap<String, OAuthToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save_token(&self, server: &str, token: &OAuthToken) -> Result<(), TokenStoreError> {
        self.tokens
            .write()
            .await
            .insert(server.to_string(), token.clone());
        Ok(())
    }

    async fn get_token(&self, server: &str) -> Result<Option<OAuthToken>, TokenStoreError> {
        Ok(self.tokens.read().await.get(server).cloned())
    }

    async fn delete_token(&self, server: &str) -> Result<(), TokenStoreError> {
        self.tokens.write().await.remove(server);
        Ok(())
    }

    async fn list_tokens(&self) -> Result<Vec<(String, OAuthToken)>, TokenStoreError> {
        Ok(self
            .tokens
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// JSON-file token store.
///
/// Every write rewrites the whole file through a temp file and a rename.
/// Writes are serialized by an async mutex; reads go to disk each time so a
/// `upmux login` in another process is picked up.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, OAuthToken>, TokenStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(TokenStoreError::Io(format!("{}: {e}", self.path.display()))),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| TokenStoreError::Serialization(format!("{}: {e}", self.path.display())))
    }

    async fn store(&self, tokens: &BTreeMap<String, OAuthToken>) -> Result<(), TokenStoreError> {
        let io_err = |e: std::io::Error| TokenStoreError::Io(format!("{}: {e}", self.path.display()));

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(tokens)
            .map_err(|e| TokenStoreError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        restrict_permissions(&tmp).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!(path = %self.path.display(), count = tokens.len(), "Token store written");
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save_token(&self, server: &str, token: &OAuthToken) -> Result<(), TokenStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tokens = self.load().await?;
        tokens.insert(server.to_string(), token.clone());
        self.store(&tokens).await
    }

    async fn get_token(&self, server: &str) -> Result<Option<OAuthToken>, TokenStoreError> {
        Ok(self.load().await?.remove(server))
    }

    async fn delete_token(&self, server: &str) -> Result<(), TokenStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tokens = self.load().await?;
        if tokens.remove(server).is_some() {
            self.store(&tokens).await?;
        }
        Ok(())
    }

    async fn list_tokens(&self) -> Result<Vec<(String, OAuthToken)>, TokenStoreError> {
        Ok(self.load().await?.into_iter().collect())
    }
}
