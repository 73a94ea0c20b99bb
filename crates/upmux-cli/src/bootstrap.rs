//! CLI bootstrap - the composition root.
//!
//! This module is the only place where concrete adapters are wired together:
//! - Config service backed by the JSON config file
//! - File token store and the OAuth client (via upmux-runtime)
//! - MCP transports (via upmux-mcp)
//! - Docker sandbox with the persisted instance id
//!
//! Command handlers receive the composed [`CliContext`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use upmux_core::paths::{data_root, default_config_path, token_store_path};
use upmux_core::{ConfigService, ConfigSource, Sandbox, TokenStore};
use upmux_mcp::McpTransportFactory;
use upmux_runtime::{
    Authenticator, DockerSandbox, FileTokenStore, OAuthClient, OAuthFlowCoordinator, Supervisor,
    SupervisorDeps, SupervisorSettings, TokenRefresher, instance_file, load_or_create_instance_id,
};

/// Bootstrap configuration for the CLI.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub config_path: PathBuf,
}

impl CliConfig {
    /// Use `explicit` when given, otherwise the default config location.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => path,
            None => default_config_path()?,
        };
        Ok(Self { config_path })
    }
}

/// Fully composed context for CLI commands.
pub struct CliContext {
    pub config: Arc<ConfigService>,
    pub tokens: Arc<dyn TokenStore>,
    pub flows: Arc<OAuthFlowCoordinator>,
    pub oauth: Arc<OAuthClient>,
    pub data_dir: PathBuf,
}

impl CliContext {
    pub fn config_source(&self) -> Arc<dyn ConfigSource> {
        Arc::clone(&self.config) as Arc<dyn ConfigSource>
    }

    /// The docker sandbox for this installation, if docker answers.
    pub async fn sandbox(&self) -> Option<Arc<DockerSandbox>> {
        let instance_id = load_or_create_instance_id(&instance_file());
        let sandbox = DockerSandbox::new(instance_id);
        if sandbox.is_available().await {
            debug!(instance_id = %sandbox.instance_id(), "Docker sandbox available");
            Some(Arc::new(sandbox))
        } else {
            warn!("Docker is not available; isolated servers will fail to start");
            None
        }
    }

    /// Build a supervisor over the production adapters.
    pub fn supervisor(&self, sandbox: Option<Arc<DockerSandbox>>) -> Result<Supervisor> {
        let transports = McpTransportFactory::new(Arc::clone(&self.tokens))
            .context("failed to build upstream transports")?;
        let refresher = TokenRefresher::new(
            Arc::clone(&self.oauth),
            Arc::clone(&self.tokens),
            self.config_source(),
        );

        let mut deps = SupervisorDeps::new(Arc::new(transports), Arc::clone(&self.tokens))
            .with_authenticator(Arc::clone(&self.oauth) as Arc<dyn Authenticator>)
            .with_refresher(Arc::new(refresher))
            .with_flows(Arc::clone(&self.flows));
        if let Some(sandbox) = sandbox {
            deps = deps.with_sandbox(sandbox as Arc<dyn Sandbox>);
        }
        Ok(Supervisor::new(deps, SupervisorSettings::default()))
    }
}

/// Bootstrap the CLI.
///
/// 1. Loads and validates the config file (a missing file is an empty config)
/// 2. Opens the token store under the configured or default data directory
/// 3. Creates the shared OAuth flow coordinator and client
pub fn bootstrap(config: &CliConfig) -> Result<CliContext> {
    let service = ConfigService::from_file(&config.config_path)
        .with_context(|| format!("failed to load {}", config.config_path.display()))?;

    let data_dir = match service.current().data_dir() {
        Some(dir) => dir.clone(),
        None => data_root()?,
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let tokens: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(token_store_path(&data_dir)));
    let flows = Arc::new(OAuthFlowCoordinator::new());
    let oauth = Arc::new(
        OAuthClient::new(Arc::clone(&tokens), Arc::clone(&flows))
            .context("failed to build OAuth client")?,
    );

    info!(
        config = %config.config_path.display(),
        data_dir = %data_dir.display(),
        "Bootstrapped upmux"
    );
    Ok(CliContext {
        config: Arc::new(service),
        tokens,
        flows,
        oauth,
        data_dir,
    })
}
