//! Docker-backed sandbox.
//!
//! Upstreams run as `docker run --rm -i ... <image> <command> <args>`. The
//! stdio transport spawns that command line, so the container lives exactly
//! as long as the transport's child process unless something goes wrong.
//! Labels make every container findable by the sweep either way.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::process::Command;
use tracing::{debug, info, warn};
use upmux_core::{
    ContainerLabels, ContainerState, DockerIsolationDefaults, LabelSelector, LaunchSpec,
    ManagedContainer, ResourceError, Sandbox, ServerConfig,
};

/// Grace period passed to `docker stop -t`.
pub const STOP_GRACE_SECS: u32 = 10;

/// Upper bound for any single docker CLI call.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const NAME_PREFIX: &str = "upmux";
const MAX_NAME_LEN: usize = 200;

/// Sandbox that shells out to the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    docker: String,
    instance_id: String,
    cid_dir: PathBuf,
}

impl DockerSandbox {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            docker: "docker".to_string(),
            instance_id: instance_id.into(),
            cid_dir: std::env::temp_dir(),
        }
    }

    /// Use a different docker-compatible binary (`podman`, a wrapper script).
    #[must_use]
    pub fn with_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    #[must_use]
    pub fn with_cid_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cid_dir = dir.into();
        self
    }

    /// Arguments for `docker run` (excluding the binary itself).
    pub fn build_run_args(
        &self,
        server: &ServerConfig,
        defaults: &DockerIsolationDefaults,
        container_name: &str,
        cid_file: &std::path::Path,
        labels: &ContainerLabels,
    ) -> Result<Vec<String>, ResourceError> {
        let start_failed = |reason: String| ResourceError::StartFailed {
            server: server.name.clone(),
            reason,
        };
        let image = defaults
            .image_for(server)
            .map_err(|e| start_failed(e.to_string()))?;
        let command = server
            .command
            .clone()
            .ok_or_else(|| start_failed("no command to run in the sandbox".to_string()))?;
        let overrides = server.isolation.clone().unwrap_or_default();

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "--name".into(),
            container_name.to_string(),
            "--cidfile".into(),
            cid_file.display().to_string(),
        ];
        for (key, value) in labels.pairs() {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }

        if let Some(driver) = overrides.log_driver.as_ref().or(defaults.log_driver.as_ref()) {
            args.push("--log-driver".into());
            args.push(driver.clone());
        }
        if let Some(size) = overrides.log_max_size.as_ref().or(defaults.log_max_size.as_ref()) {
            args.push("--log-opt".into());
            args.push(format!("max-size={size}"));
        }
        if let Some(files) = overrides
            .log_max_files
            .as_ref()
            .or(defaults.log_max_files.as_ref())
        {
            args.push("--log-opt".into());
            args.push(format!("max-file={files}"));
        }
        if let Some(network) = overrides.network_mode.as_ref().or(defaults.network_mode.as_ref()) {
            args.push("--network".into());
            args.push(network.clone());
        }
        if let Some(memory) = &defaults.memory_limit {
            args.push("--memory".into());
            args.push(memory.clone());
        }
        if let Some(cpus) = &defaults.cpu_limit {
            args.push("--cpus".into());
            args.push(cpus.clone());
        }
        if let Some(workdir) = &overrides.working_dir {
            args.push("--workdir".into());
            args.push(workdir.clone());
        }
        for (key, value) in &server.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.extend(defaults.extra_args.iter().cloned());
        args.extend(overrides.extra_args.iter().cloned());

        args.push(image);
        args.push(command);
        args.extend(server.args.iter().cloned());
        Ok(args)
    }

    async fn run(&self, args: &[String]) -> Result<String, ResourceError> {
        let command_line = format!("{} {}", self.docker, args.join(" "));
        debug!(command = %command_line, "Running docker command");

        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(&self.docker)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ResourceError::Timeout(command_line.clone()))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ResourceError::Unavailable(format!("'{}' not found on PATH", self.docker))
            } else {
                ResourceError::Command {
                    command: command_line.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ResourceError::Command {
                command: command_line,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Remove every matching container with `docker rm -f`.
    pub async fn remove_by_label(&self, selector: &LabelSelector) -> Result<Vec<String>, ResourceError> {
        let ids = self.list_by_label(selector).await?;
        if ids.is_empty() {
            return Ok(ids);
        }
        let mut args = vec!["rm".to_string(), "-f".to_string()];
        args.extend(ids.iter().cloned());
        self.run(&args).await?;
        info!(count = ids.len(), "Force-removed sandbox containers");
        Ok(ids)
    }
}

fn is_missing(err: &ResourceError) -> bool {
    matches!(err, ResourceError::Command { reason, .. } if reason.contains("No such container"))
}

/// Container-name-safe form of a server name.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            c
        } else {
            '-'
        };
        if !(c == '-' && out.ends_with('-')) {
            out.push(c);
        }
    }
    let mut out = out.trim_matches(|c| c == '-' || c == '.').to_string();
    if out.is_empty() {
        out = "server".to_string();
    }
    if out.len() > MAX_NAME_LEN {
        out.truncate(MAX_NAME_LEN);
        out = out.trim_end_matches(['-', '.']).to_string();
    }
    out
}

fn random_suffix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..4)
        .map(|_| char::from(CHARSET[rng.gen_range(0..CHARSET.len())]))
        .collect()
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn is_available(&self) -> bool {
        let args = ["version".to_string(), "--format".to_string(), "{{.Server.Version}}".to_string()];
        match self.run(&args).await {
            Ok(version) => {
                debug!(version = %version.trim(), "Docker daemon available");
                true
            }
            Err(e) => {
                debug!(error = %e, "Docker unavailable");
                false
            }
        }
    }

    async fn create_labeled(
        &self,
        server: &ServerConfig,
        defaults: &DockerIsolationDefaults,
    ) -> Result<ManagedContainer, ResourceError> {
        let container_name = format!(
            "{NAME_PREFIX}-{}-{}",
            sanitize_name(&server.name),
            random_suffix()
        );
        let cid_file = self.cid_dir.join(format!("{container_name}.cid"));
        // docker refuses to start if the cidfile already exists.
        let _ = tokio::fs::remove_file(&cid_file).await;

        let labels = ContainerLabels::new(&self.instance_id, &server.name);
        let args = self.build_run_args(server, defaults, &container_name, &cid_file, &labels)?;

        debug!(server = %server.name, container = %container_name, "Prepared sandbox container");
        Ok(ManagedContainer {
            server_name: server.name.clone(),
            container_name,
            cid_file,
            container_id: None,
            labels,
            launch: LaunchSpec {
                program: self.docker.clone(),
                args,
            },
        })
    }

    async fn inspect(&self, container: &ManagedContainer) -> Result<ContainerState, ResourceError> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            container.container_name.clone(),
        ];
        match self.run(&args).await {
            Ok(status) => Ok(match status.trim() {
                "running" | "restarting" | "paused" => ContainerState::Running,
                "created" => ContainerState::Created,
                _ => ContainerState::Exited,
            }),
            Err(e) if is_missing(&e) => Ok(ContainerState::Missing),
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, container: &ManagedContainer) -> Result<(), ResourceError> {
        let name = &container.container_name;
        let stop = [
            "stop".to_string(),
            "-t".to_string(),
            STOP_GRACE_SECS.to_string(),
            name.clone(),
        ];
        let result = match self.run(&stop).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => {
                warn!(container = %name, error = %e, "docker stop failed, killing");
                match self.run(&["kill".to_string(), name.clone()]).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_missing(&e) => Ok(()),
                    Err(e) => Err(ResourceError::StopFailed {
                        container: name.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
        };
        let _ = tokio::fs::remove_file(&container.cid_file).await;
        if result.is_ok() {
            debug!(server = %container.server_name, container = %name, "Sandbox container stopped");
        }
        result
    }

    async fn list_by_label(&self, selector: &LabelSelector) -> Result<Vec<String>, ResourceError> {
        let mut args = vec!["ps".to_string(), "-a".to_string(), "-q".to_string()];
        for filter in selector.filters() {
            args.push("--filter".to_string());
            args.push(format!("label={filter}"));
        }
        let stdout = self.run(&args).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn stop_by_label(&self, selector: &LabelSelector) -> Result<Vec<String>, ResourceError> {
        let ids = self.list_by_label(selector).await?;
        if ids.is_empty() {
            return Ok(ids);
        }

        let mut stop = vec!["stop".to_string(), "-t".to_string(), "2".to_string()];
        stop.extend(ids.iter().cloned());
        if let Err(e) = self.run(&stop).await {
            warn!(error = %e, "Label sweep stop failed, killing");
            let mut kill = vec!["kill".to_string()];
            kill.extend(ids.iter().cloned());
            if let Err(e) = self.run(&kill).await {
                warn!(error = %e, "Label sweep kill failed");
            }
        }

        // Containers run with --rm; anything left is removed outright.
        let remaining = self.list_by_label(selector).await.unwrap_or_default();
        if !remaining.is_empty() {
            let mut rm = vec!["rm".to_string(), "-f".to_string()];
            rm.extend(remaining);
            self.run(&rm).await?;
        }

        info!(count = ids.len(), "Swept sandbox containers by label");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use upmux_core::IsolationSettings;

    use super::*;

    fn sandbox() -> DockerSandbox {
        DockerSandbox::new("inst-1").with_cid_dir("/tmp/cids")
    }

    #[test]
    fn test_run_args_layout() {
        let mut server = ServerConfig::stdio("fs", "npx", vec!["-y".into(), "server-fs".into()]);
        server.env = BTreeMap::from([("TOKEN".into(), "x".into())]);
        server.isolation = Some(IsolationSettings {
            enabled: Some(true),
            network_mode: Some("none".into()),
            extra_args: vec!["--read-only".into()],
            ..IsolationSettings::default()
        });
        let defaults = DockerIsolationDefaults {
            memory_limit: Some("512m".into()),
            ..DockerIsolationDefaults::default()
        };
        let labels = ContainerLabels::new("inst-1", "fs");
        let args = sandbox()
            .build_run_args(
                &server,
                &defaults,
                "upmux-fs-abcd",
                std::path::Path::new("/tmp/cids/upmux-fs-abcd.cid"),
                &labels,
            )
            .unwrap();

        assert_eq!(&args[..3], ["run", "--rm", "-i"]);
        let joined = args.join(" ");
        assert!(joined.contains("--name upmux-fs-abcd"));
        assert!(joined.contains("--label dev.upmux.instance=inst-1"));
        assert!(joined.contains("--label dev.upmux.server=fs"));
        assert!(joined.contains("--log-opt max-size=100m"));
        assert!(joined.contains("--log-opt max-file=3"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("-e TOKEN=x"));
        assert!(joined.ends_with("--read-only node:20 npx -y server-fs"));
    }

    #[test]
    fn test_run_args_without_image_fail() {
        let server = ServerConfig::stdio("bin", "my-binary", vec![]);
        let labels = ContainerLabels::new("inst-1", "bin");
        let err = sandbox()
            .build_run_args(
                &server,
                &DockerIsolationDefaults::default(),
                "upmux-bin-0000",
                std::path::Path::new("/tmp/x.cid"),
                &labels,
            )
            .unwrap_err();
        assert!(matches!(err, ResourceError::StartFailed { .. }));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("svc-a"), "svc-a");
        assert_eq!(sanitize_name("my server!!"), "my-server");
        assert_eq!(sanitize_name("--"), "server");
        assert_eq!(sanitize_name(&"x".repeat(300)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_random_suffix_shape() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let sandbox = DockerSandbox::new("inst").with_binary("definitely-not-a-docker-binary");
        assert!(!sandbox.is_available().await);
        assert!(matches!(
            sandbox.list_by_label(&LabelSelector::AllManaged).await,
            Err(ResourceError::Unavailable(_))
        ));
    }
}
