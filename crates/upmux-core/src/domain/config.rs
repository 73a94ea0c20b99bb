//! Upstream server configuration types.
//!
//! These types are the desired state the supervisor reconciles against.
//! They are immutable once placed in a snapshot; a changed server is a new
//! `ServerConfig` value with the same name.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Protocol declared for an upstream server in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Local subprocess speaking JSON-RPC over stdin/stdout.
    Stdio,
    /// Plain HTTP JSON-RPC endpoint.
    Http,
    /// Legacy SSE endpoint (served through the streaming HTTP transport).
    Sse,
    /// Streamable HTTP endpoint (JSON or SSE-framed responses, session header).
    StreamableHttp,
    /// Infer from the presence of `command` or `url`.
    #[default]
    Auto,
}

/// The closed set of transport variants an actor can be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local process.
    Stdio,
    /// HTTP request/response.
    Http,
    /// Streaming HTTP.
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
            Self::StreamableHttp => write!(f, "streamable-http"),
        }
    }
}

/// OAuth settings for a server.
///
/// Presence of this block (even empty) marks the server as OAuth-protected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default = "default_true")]
    pub pkce_enabled: bool,
    /// Additional authorization/token parameters (e.g. RFC 8707 `resource`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_params: BTreeMap<String, String>,
}

const fn default_true() -> bool {
    true
}

/// Per-server sandbox isolation overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationSettings {
    /// `None` inherits the global docker isolation flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_max_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_max_files: Option<String>,
}

/// Configuration for a single upstream server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationSettings>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl ServerConfig {
    /// Create a remote server config with defaults for everything else.
    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::blank(name.into())
        }
    }

    /// Create a local-process server config.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            protocol: Protocol::Stdio,
            command: Some(command.into()),
            args,
            ..Self::blank(name.into())
        }
    }

    const fn blank(name: String) -> Self {
        Self {
            name,
            protocol: Protocol::Auto,
            url: None,
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            headers: BTreeMap::new(),
            oauth: None,
            isolation: None,
            enabled: true,
            quarantined: false,
            created: None,
            updated: None,
        }
    }

    /// Resolve the declared protocol to a concrete transport variant.
    pub const fn transport_kind(&self) -> TransportKind {
        match self.protocol {
            Protocol::Stdio => TransportKind::Stdio,
            Protocol::Http => TransportKind::Http,
            Protocol::Sse | Protocol::StreamableHttp => TransportKind::StreamableHttp,
            Protocol::Auto => {
                if self.command.is_some() {
                    TransportKind::Stdio
                } else {
                    TransportKind::StreamableHttp
                }
            }
        }
    }

    /// Whether this server requires OAuth.
    pub const fn uses_oauth(&self) -> bool {
        self.oauth.is_some()
    }

    /// Whether sandbox isolation applies, given the global default.
    pub fn isolation_enabled(&self, defaults: &DockerIsolationDefaults) -> bool {
        if self.transport_kind() != TransportKind::Stdio {
            return false;
        }
        self.isolation
            .as_ref()
            .and_then(|i| i.enabled)
            .unwrap_or(defaults.enabled)
    }

    /// True when `other` differs in a field that requires a new connection.
    ///
    /// `enabled`, `quarantined` and the timestamps can be hot-swapped.
    pub fn is_structurally_different(&self, other: &Self) -> bool {
        self.protocol != other.protocol
            || self.url != other.url
            || self.command != other.command
            || self.args != other.args
            || self.working_dir != other.working_dir
            || self.env != other.env
            || self.headers != other.headers
            || self.oauth != other.oauth
            || self.isolation != other.isolation
    }

    /// True when `other` differs in anything the supervisor cares about.
    pub fn differs_from(&self, other: &Self) -> bool {
        self.is_structurally_different(other)
            || self.enabled != other.enabled
            || self.quarantined != other.quarantined
    }

    /// Validate a single server definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidServer {
                name: self.name.clone(),
                reason: "name cannot be empty".to_string(),
            });
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(ConfigError::InvalidServer {
                name: self.name.clone(),
                reason: "name may only contain letters, digits, '.', '_' and '-'".to_string(),
            });
        }

        match self.transport_kind() {
            TransportKind::Stdio => {
                if self.command.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err(ConfigError::InvalidServer {
                        name: self.name.clone(),
                        reason: "stdio servers require a command".to_string(),
                    });
                }
            }
            TransportKind::Http | TransportKind::StreamableHttp => {
                let url = self.url.as_deref().unwrap_or_default();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::InvalidServer {
                        name: self.name.clone(),
                        reason: format!("remote servers require an http(s) url, got '{url}'"),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Global docker isolation defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerIsolationDefaults {
    #[serde(default)]
    pub enabled: bool,
    /// Runtime command basename (`npx`, `uvx`, ...) to image.
    #[serde(default = "default_images")]
    pub default_images: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_driver: Option<String>,
    #[serde(default = "default_log_max_size")]
    pub log_max_size: Option<String>,
    #[serde(default = "default_log_max_files")]
    pub log_max_files: Option<String>,
}

fn default_images() -> BTreeMap<String, String> {
    [
        ("npx", "node:20"),
        ("node", "node:20"),
        ("uvx", "python:3.11"),
        ("python", "python:3.11"),
        ("python3", "python:3.11"),
        ("pipx", "python:3.11"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[allow(clippy::unnecessary_wraps)]
fn default_log_max_size() -> Option<String> {
    Some("100m".to_string())
}

#[allow(clippy::unnecessary_wraps)]
fn default_log_max_files() -> Option<String> {
    Some("3".to_string())
}

impl Default for DockerIsolationDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            default_images: default_images(),
            registry: None,
            network_mode: None,
            memory_limit: None,
            cpu_limit: None,
            extra_args: Vec::new(),
            log_driver: None,
            log_max_size: default_log_max_size(),
            log_max_files: default_log_max_files(),
        }
    }
}

impl DockerIsolationDefaults {
    /// Pick the image for a server: explicit override first, then the runtime default.
    pub fn image_for(&self, server: &ServerConfig) -> Result<String, ConfigError> {
        let image = server
            .isolation
            .as_ref()
            .and_then(|i| i.image.clone())
            .or_else(|| {
                let command = server.command.as_deref()?;
                let runtime = std::path::Path::new(command).file_name()?.to_str()?;
                self.default_images.get(runtime).cloned()
            })
            .ok_or_else(|| ConfigError::InvalidServer {
                name: server.name.clone(),
                reason: "isolation enabled but no image configured for this command".to_string(),
            })?;

        Ok(match &self.registry {
            Some(registry) if !image.contains('/') => format!("{registry}/{image}"),
            _ => image,
        })
    }
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub docker_isolation: DockerIsolationDefaults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl ProxyConfig {
    /// Validate every server and reject duplicate names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::DuplicateServer(server.name.clone()));
            }
        }
        Ok(())
    }

    /// Look up a server by name.
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}
