//! Stdio transport: JSON-RPC over a child process's stdin/stdout.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as SyncMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};
use upmux_core::{ServerConfig, Session, ToolInfo, Transport, TransportError, TransportKind};

use crate::child::{TERM_GRACE, shutdown_child};
use crate::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse, MAX_TOOL_PAGES};
use crate::path::{build_effective_path, resolve_command, validate_working_dir};

/// Per-request read timeout. Generous because `npx`/`uvx` may install on first run.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Non-response lines tolerated before a request is abandoned.
const MAX_SKIPPED_LINES: usize = 1000;

/// Spawns local upstream processes.
#[derive(Debug, Clone)]
pub struct StdioTransport {
    request_timeout: Duration,
    path_extra: Option<String>,
}

impl StdioTransport {
    pub const fn new() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
            path_extra: None,
        }
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Extra PATH entries appended when resolving and spawning commands.
    #[must_use]
    pub fn with_path_extra(mut self, path_extra: impl Into<String>) -> Self {
        self.path_extra = Some(path_extra.into());
        self
    }

    fn spawn(&self, config: &ServerConfig) -> Result<Child, TransportError> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| TransportError::Spawn("no command configured".to_string()))?;

        let search_path = build_effective_path(None, self.path_extra.as_deref());
        let exe = resolve_command(command, &search_path).map_err(TransportError::Spawn)?;
        let child_path = build_effective_path(Some(&exe), self.path_extra.as_deref());

        if let Some(cwd) = config.working_dir.as_deref() {
            validate_working_dir(cwd).map_err(TransportError::Spawn)?;
        }

        let mut cmd = Command::new(&exe);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PATH", &child_path)
            .envs(&config.env)
            .kill_on_drop(true);
        if let Some(cwd) = config.working_dir.as_deref() {
            cmd.current_dir(cwd);
        }

        cmd.spawn().map_err(|e| {
            TransportError::Spawn(format!(
                "failed to spawn '{}': {e} (args: {:?})",
                exe.display(),
                config.args
            ))
        })
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Session>, TransportError> {
        let mut child = self.spawn(config)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to capture stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{line}");
                }
            });
        }

        let mut session = StdioSession {
            server: config.name.clone(),
            io: Mutex::new(StdioIo {
                stdin: Some(stdin),
                stdout: BufReader::new(stdout).lines(),
            }),
            child: SyncMutex::new(Some(child)),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            supports_tools: false,
            request_timeout: self.request_timeout,
        };

        match session.handshake().await {
            Ok(()) => Ok(Box::new(session)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }
}

struct StdioIo {
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// A live stdio connection.
pub struct StdioSession {
    server: String,
    io: Mutex<StdioIo>,
    /// Polled by `is_alive`, so behind a sync lock.
    child: SyncMutex<Option<Child>>,
    next_id: AtomicU64,
    alive: AtomicBool,
    supports_tools: bool,
    request_timeout: Duration,
}

impl StdioSession {
    async fn handshake(&mut self) -> Result<(), TransportError> {
        let result = self
            .request("initialize", Some(jsonrpc::initialize_params()))
            .await?;
        self.supports_tools = jsonrpc::supports_tools(&result);
        self.notify("notifications/initialized").await
    }

    async fn write_line(io: &mut StdioIo, line: String) -> Result<(), TransportError> {
        let stdin = io.stdin.as_mut().ok_or(TransportError::Closed)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let line = serde_json::to_string(&jsonrpc::notification(method))?;
        let mut io = self.io.lock().await;
        Self::write_line(&mut io, line).await
    }

    async fn read_response(
        &self,
        io: &mut StdioIo,
        id: u64,
    ) -> Result<JsonRpcResponse, TransportError> {
        for _ in 0..MAX_SKIPPED_LINES {
            let Some(line) = io.stdout.next_line().await? else {
                return Err(TransportError::Closed);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(response) if response.answers(id) => return Ok(response),
                Ok(_) => debug!(server = %self.server, "Skipping unrelated JSON-RPC message"),
                Err(_) => debug!(server = %self.server, line = trimmed, "Skipping non-JSON output"),
            }
        }
        Err(TransportError::Protocol(
            "no matching JSON-RPC response received".to_string(),
        ))
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let mut io = self.io.lock().await;
        Self::write_line(&mut io, line).await?;

        let read = self.read_response(&mut io, id);
        let response = match timeout(self.request_timeout, read).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                if matches!(e, TransportError::Closed | TransportError::Io(_)) {
                    self.alive.store(false, Ordering::SeqCst);
                }
                return Err(e);
            }
            Err(_) => return Err(TransportError::Timeout),
        };
        response.into_result()
    }
}

#[async_trait]
impl Session for StdioSession {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError> {
        if !self.supports_tools {
            return Ok(Vec::new());
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let result = self
                .request("tools/list", jsonrpc::tools_list_params(cursor.as_deref()))
                .await?;
            let (page, next) = jsonrpc::parse_tools_page(result)?;
            tools.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
        warn!(server = %self.server, pages = MAX_TOOL_PAGES, "tools/list pagination truncated");
        Ok(tools)
    }

    fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let mut guard = self
            .child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(child) = guard.as_mut()
            && let Ok(Some(exit)) = child.try_wait()
        {
            debug!(server = %self.server, %exit, "Upstream process exited");
            self.alive.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        // Dropping stdin signals EOF to well-behaved servers.
        self.io.get_mut().stdin = None;
        let child = self
            .child
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            if let Err(e) = shutdown_child(&mut child, TERM_GRACE).await {
                warn!(server = %self.server, error = %e, "Failed to stop upstream process");
            }
        }
    }
}
