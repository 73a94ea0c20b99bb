//! Persistent sandbox instance id.
//!
//! The id is the value of the instance label on every container this
//! installation starts. It survives restarts (kept in the temp directory)
//! so a fresh process can sweep containers orphaned by a crashed one.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

const INSTANCE_FILE: &str = "upmux-instance-id";

/// Default location of the instance id file.
pub fn instance_file() -> PathBuf {
    std::env::temp_dir().join(INSTANCE_FILE)
}

/// Read the instance id from `path`, creating and saving a new one if absent.
///
/// Failing to save is logged, not fatal: the id is still unique for this run.
pub fn load_or_create_instance_id(path: &Path) -> String {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let id = existing.trim();
        if is_valid_id(id) {
            debug!(instance_id = %id, "Reusing sandbox instance id");
            return id.to_string();
        }
        warn!(path = %path.display(), "Ignoring malformed sandbox instance id");
    }

    let id = uuid::Uuid::new_v4().simple().to_string();
    if let Err(e) = std::fs::write(path, &id) {
        warn!(path = %path.display(), error = %e, "Failed to persist sandbox instance id");
    }
    id
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
