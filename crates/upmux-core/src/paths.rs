//! Canonical paths for upmux data files.
//!
//! `UPMUX_DATA_DIR` overrides the data root; otherwise `~/.upmux` is used.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Environment variable overriding the data root.
pub const DATA_DIR_ENV: &str = "UPMUX_DATA_DIR";

const CONFIG_FILE: &str = "config.json";
const TOKENS_FILE: &str = "oauth_tokens.json";

/// Root directory for upmux state.
pub fn data_root() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".upmux"))
        .ok_or(ConfigError::NoHomeDir)
}

/// Default location of the config file.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(data_root()?.join(CONFIG_FILE))
}

/// Token file inside a data directory.
pub fn token_store_path(data_dir: &Path) -> PathBuf {
    data_dir.join(TOKENS_FILE)
}
