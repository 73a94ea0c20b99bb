//! Config service - owns the desired configuration and publishes snapshots.
//!
//! Readers load the current snapshot lock-free. Mutations are serialized by a
//! short lock so versions stay strictly increasing, then published through a
//! `watch` channel so subscribers always see the latest snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::{ConfigSnapshot, ProxyConfig, ServerConfig, UpdateKind};
use crate::error::ConfigError;
use crate::ports::ConfigSource;

/// Holds the desired server list and publishes versioned snapshots.
pub struct ConfigService {
    current: ArcSwap<ConfigSnapshot>,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl ConfigService {
    /// Create a service from an in-memory config (version 1).
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        Self::build(config, None, "inline")
    }

    /// Load from a JSON file. A missing file yields an empty config.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = read_config(&path)?;
        let source = path.display().to_string();
        Self::build(config, Some(path), &source)
    }

    fn build(config: ProxyConfig, path: Option<PathBuf>, source: &str) -> Result<Self, ConfigError> {
        config.validate()?;
        let snapshot = Arc::new(ConfigSnapshot::new(1, &config, UpdateKind::Init, source));
        let (tx, _rx) = watch::channel(Arc::clone(&snapshot));
        info!(servers = snapshot.len(), source, "Loaded configuration");
        Ok(Self {
            current: ArcSwap::new(snapshot),
            tx,
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the whole config and publish a new version.
    pub fn update(
        &self,
        config: ProxyConfig,
        kind: UpdateKind,
        source: &str,
    ) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.publish_locked(config, kind, source)
    }

    fn publish_locked(
        &self,
        config: ProxyConfig,
        kind: UpdateKind,
        source: &str,
    ) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        config.validate()?;
        let version = self.current.load().version() + 1;
        let snapshot = Arc::new(ConfigSnapshot::new(version, &config, kind, source));
        self.current.store(Arc::clone(&snapshot));
        self.tx.send_replace(Arc::clone(&snapshot));
        debug!(version, ?kind, source, "Published config snapshot");
        Ok(snapshot)
    }

    /// Apply a mutation to a copy of the current config and publish it.
    fn modify<F>(&self, source: &str, mutate: F) -> Result<Arc<ConfigSnapshot>, ConfigError>
    where
        F: FnOnce(&mut ProxyConfig) -> Result<(), ConfigError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut config = self.current.load().to_config();
        mutate(&mut config)?;
        self.publish_locked(config, UpdateKind::Modify, source)
    }

    /// Insert a server or replace the one with the same name.
    pub fn upsert_server(&self, mut server: ServerConfig) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        server.validate()?;
        self.modify("api", |config| {
            let now = Utc::now();
            match config.servers.iter_mut().find(|s| s.name == server.name) {
                Some(existing) => {
                    server.created = existing.created.or(Some(now));
                    server.updated = Some(now);
                    *existing = server;
                }
                None => {
                    server.created = Some(now);
                    config.servers.push(server);
                }
            }
            Ok(())
        })
    }

    pub fn remove_server(&self, name: &str) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        self.modify("api", |config| {
            let before = config.servers.len();
            config.servers.retain(|s| s.name != name);
            if config.servers.len() == before {
                return Err(ConfigError::ServerNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        self.modify_server(name, |server| server.enabled = enabled)
    }

    pub fn set_quarantined(
        &self,
        name: &str,
        quarantined: bool,
    ) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        self.modify_server(name, |server| server.quarantined = quarantined)
    }

    fn modify_server<F>(&self, name: &str, apply: F) -> Result<Arc<ConfigSnapshot>, ConfigError>
    where
        F: FnOnce(&mut ServerConfig),
    {
        self.modify("api", |config| {
            let server = config
                .servers
                .iter_mut()
                .find(|s| s.name == name)
                .ok_or_else(|| ConfigError::ServerNotFound(name.to_string()))?;
            apply(server);
            server.updated = Some(Utc::now());
            Ok(())
        })
    }

    /// Re-read the backing file.
    ///
    /// Returns `None` when the file content matches the current config, so a
    /// touched-but-unchanged file does not bump the version.
    pub fn reload_from_file(&self) -> Result<Option<Arc<ConfigSnapshot>>, ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoBackingFile)?;
        let config = read_config(path)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.current.load().to_config() == config {
            debug!(path = %path.display(), "Config file unchanged");
            return Ok(None);
        }
        let snapshot = self.publish_locked(config, UpdateKind::Reload, &path.display().to_string())?;
        info!(version = snapshot.version(), servers = snapshot.len(), "Reloaded configuration");
        Ok(Some(snapshot))
    }

    /// Write the current config to the backing file atomically.
    pub fn save_to_file(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoBackingFile)?;
        let config = self.current.load().to_config();
        write_config(path, &config)
    }
}

impl ConfigSource for ConfigService {
    fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.tx.subscribe()
    }
}

fn read_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Config file missing, starting empty");
            return Ok(ProxyConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };
    if content.trim().is_empty() {
        return Ok(ProxyConfig::default());
    }
    serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_config(path: &Path, config: &ProxyConfig) -> Result<(), ConfigError> {
    let write_err = |reason: String| ConfigError::Write {
        path: path.to_path_buf(),
        reason,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
    }
    let json = serde_json::to_string_pretty(config).map_err(|e| write_err(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| write_err(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| write_err(e.to_string()))
}
