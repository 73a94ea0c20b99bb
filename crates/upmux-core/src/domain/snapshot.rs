//! Immutable, versioned configuration snapshots.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::{DockerIsolationDefaults, ProxyConfig, ServerConfig};

/// Why a snapshot was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Initial load at startup.
    Init,
    /// Reloaded from disk.
    Reload,
    /// Mutated through the API.
    Modify,
}

/// An immutable view of the desired configuration at one version.
///
/// Shared by `Arc`; servers are individually `Arc`ed so actors can hold
/// their own config without copying the whole snapshot.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    version: u64,
    servers: Vec<Arc<ServerConfig>>,
    docker_isolation: Arc<DockerIsolationDefaults>,
    data_dir: Option<PathBuf>,
    kind: UpdateKind,
    source: String,
    created_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn new(version: u64, config: &ProxyConfig, kind: UpdateKind, source: impl Into<String>) -> Self {
        Self {
            version,
            servers: config.servers.iter().cloned().map(Arc::new).collect(),
            docker_isolation: Arc::new(config.docker_isolation.clone()),
            data_dir: config.data_dir.clone(),
            kind,
            source: source.into(),
            created_at: Utc::now(),
        }
    }

    /// Build a snapshot directly from server configs (tests, embedding).
    pub fn from_servers(version: u64, servers: Vec<ServerConfig>) -> Self {
        let config = ProxyConfig {
            servers,
            ..ProxyConfig::default()
        };
        Self::new(version, &config, UpdateKind::Modify, "inline")
    }

    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn servers(&self) -> &[Arc<ServerConfig>] {
        &self.servers
    }

    pub fn docker_isolation(&self) -> &Arc<DockerIsolationDefaults> {
        &self.docker_isolation
    }

    pub const fn data_dir(&self) -> Option<&PathBuf> {
        self.data_dir.as_ref()
    }

    pub const fn kind(&self) -> UpdateKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Look up a server by name.
    pub fn server(&self, name: &str) -> Option<&Arc<ServerConfig>> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Rebuild the owned config this snapshot was made from.
    pub fn to_config(&self) -> ProxyConfig {
        ProxyConfig {
            servers: self.servers.iter().map(|s| (**s).clone()).collect(),
            docker_isolation: (*self.docker_isolation).clone(),
            data_dir: self.data_dir.clone(),
        }
    }
}
