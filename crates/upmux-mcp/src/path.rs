//! Executable resolution for local upstream processes.
//!
//! Config files name commands the way a shell would (`npx`, `uvx`,
//! `/opt/bin/server`). Bare names are resolved against an enriched PATH so
//! launches behave the same from a service manager as from a terminal.

use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[cfg(unix)]
const PATH_SEPARATOR: &str = ":";
#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";

/// Locations commonly missing from a service-manager PATH.
#[cfg(unix)]
const FALLBACK_PATHS: &[&str] = &[
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
];
#[cfg(windows)]
const FALLBACK_PATHS: &[&str] = &[];

/// Check that `path` is an existing, executable file.
pub fn validate_exe_path(path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Err(format!("Executable not found: {}", path.display()));
    }
    if !path.is_file() {
        return Err(format!("Executable path is not a file: {}", path.display()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path)
            .map_err(|e| format!("Failed to check permissions: {e}"))?;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(format!("File is not executable: {}", path.display()));
        }
    }

    Ok(())
}

/// Check that a working directory exists and is a directory.
pub fn validate_working_dir(cwd: &str) -> Result<(), String> {
    let path = Path::new(cwd);
    if !path.exists() {
        return Err(format!("Working directory does not exist: {cwd}"));
    }
    if !path.is_dir() {
        return Err(format!("Working directory path is not a directory: {cwd}"));
    }
    Ok(())
}

/// Build the PATH handed to a child process.
///
/// Order: the executable's own directory, the current PATH, fallback
/// locations, then `path_extra`. Entries are deduplicated in order.
pub fn build_effective_path(exe_path: Option<&Path>, path_extra: Option<&str>) -> OsString {
    let mut entries: Vec<String> = Vec::new();

    if let Some(dir) = exe_path.and_then(Path::parent).and_then(Path::to_str) {
        if !dir.is_empty() {
            entries.push(dir.to_string());
        }
    }

    if let Some(current) = env::var_os("PATH") {
        if let Some(current) = current.to_str() {
            entries.extend(split_path(current));
        }
    }

    entries.extend(FALLBACK_PATHS.iter().map(ToString::to_string));

    if let Some(extra) = path_extra {
        entries.extend(split_path(extra));
    }

    let mut seen = HashSet::new();
    let deduped: Vec<String> = entries
        .into_iter()
        .filter(|entry| seen.insert(entry.clone()))
        .collect();
    OsString::from(deduped.join(PATH_SEPARATOR))
}

fn split_path(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(PATH_SEPARATOR)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
}

/// Resolve a configured command to an executable path.
///
/// Paths containing a separator are taken as-is; bare names are searched
/// for in `search_path`.
pub fn resolve_command(command: &str, search_path: &OsString) -> Result<PathBuf, String> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        validate_exe_path(candidate)?;
        return Ok(candidate.to_path_buf());
    }

    env::split_paths(search_path)
        .map(|dir| dir.join(command))
        .find(|path| validate_exe_path(path).is_ok())
        .ok_or_else(|| format!("Executable '{command}' not found in PATH"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_exe_path_rejects_nonexistent() {
        let result = validate_exe_path(Path::new("/nonexistent/path/to/exe"));
        assert!(result.unwrap_err().contains("not found"));
    }

    #[test]
    fn test_build_effective_path_includes_exe_dir() {
        let path = build_effective_path(Some(Path::new("/opt/tools/bin/server")), None);
        let path = path.to_str().unwrap();
        assert!(path.starts_with("/opt/tools/bin"));
    }

    #[test]
    fn test_build_effective_path_deduplicates() {
        let path = build_effective_path(Some(Path::new("/usr/bin/node")), Some("/usr/bin:/custom/path"));
        let path = path.to_str().unwrap();
        let entries: Vec<&str> = path.split(PATH_SEPARATOR).collect();
        assert_eq!(entries.iter().filter(|&&e| e == "/usr/bin").count(), 1);
        assert!(entries.contains(&"/custom/path"));
    }

    #[test]
    fn test_validate_working_dir_rejects_nonexistent() {
        let result = validate_working_dir("/nonexistent/directory");
        assert!(result.unwrap_err().contains("does not exist"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_command_searches_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fake-server");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let search = OsString::from(dir.path());
        assert_eq!(resolve_command("fake-server", &search).unwrap(), exe);
        assert!(resolve_command("missing-server", &search).is_err());
        assert_eq!(
            resolve_command(exe.to_str().unwrap(), &OsString::new()).unwrap(),
            exe
        );
    }
}
