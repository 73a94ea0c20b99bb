//! HTTP transports: plain JSON-RPC over POST and streamable HTTP.
//!
//! Streamable HTTP adds the `Mcp-Session-Id` header and may answer with an
//! SSE-framed body; plain HTTP always answers with a JSON body. OAuth
//! servers get a bearer token read from the token store on every request,
//! so a refreshed token is picked up without reconnecting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use serde_json::Value;
use tracing::{debug, warn};
use upmux_core::{
    ServerConfig, Session, TokenStore, ToolInfo, Transport, TransportError, TransportKind,
};

use crate::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse, MAX_TOOL_PAGES};

/// Session header used by streamable HTTP servers.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_BODY: usize = 512;

/// Connects to remote upstreams over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    kind: TransportKind,
    client: reqwest::Client,
    tokens: Option<Arc<dyn TokenStore>>,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport for `kind` (`Http` or `StreamableHttp`).
    pub fn new(kind: TransportKind) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("upmux/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            kind,
            client,
            tokens: None,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Attach the token store used for OAuth-protected servers.
    #[must_use]
    pub fn with_token_store(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("kind", &self.kind)
            .field("has_token_store", &self.tokens.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Session>, TransportError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| TransportError::Protocol("no url configured".to_string()))?;

        let tokens = if config.uses_oauth() {
            self.tokens.clone()
        } else {
            None
        };

        let mut session = HttpSession {
            server: config.name.clone(),
            client: self.client.clone(),
            url,
            kind: self.kind,
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            tokens,
            session_id: None,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            supports_tools: false,
            request_timeout: self.request_timeout,
        };
        session.handshake().await?;
        Ok(Box::new(session))
    }
}

/// A live HTTP connection.
pub struct HttpSession {
    server: String,
    client: reqwest::Client,
    url: String,
    kind: TransportKind,
    headers: Vec<(String, String)>,
    tokens: Option<Arc<dyn TokenStore>>,
    session_id: Option<String>,
    next_id: AtomicU64,
    alive: AtomicBool,
    supports_tools: bool,
    request_timeout: Duration,
}

impl HttpSession {
    async fn handshake(&mut self) -> Result<(), TransportError> {
        let (result, session_id) = self
            .exchange("initialize", Some(jsonrpc::initialize_params()))
            .await?;
        self.supports_tools = jsonrpc::supports_tools(&result);
        if self.kind == TransportKind::StreamableHttp {
            self.session_id = session_id;
        }
        debug!(server = %self.server, session = ?self.session_id, "HTTP upstream initialized");

        let body = serde_json::to_string(&jsonrpc::notification("notifications/initialized"))?;
        let response = self.post(body).await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        Ok(())
    }

    async fn post(&self, body: String) -> Result<reqwest::Response, TransportError> {
        let accept = match self.kind {
            TransportKind::StreamableHttp => "application/json, text/event-stream",
            TransportKind::Http | TransportKind::Stdio => "application/json",
        };

        let mut builder = self
            .client
            .post(&self.url)
            .timeout(self.request_timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept);
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(token) = self.bearer().await {
            builder = builder.header(AUTHORIZATION, token);
        }
        if let Some(id) = &self.session_id {
            builder = builder.header(SESSION_HEADER, id.as_str());
        }

        let response = builder.body(body).send().await.map_err(map_reqwest)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let resource_metadata = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_resource_metadata);
            return Err(TransportError::Unauthorized { resource_metadata });
        }
        if response.status() == StatusCode::NOT_FOUND && self.session_id.is_some() {
            self.alive.store(false, Ordering::SeqCst);
        }
        Ok(response)
    }

    async fn bearer(&self) -> Option<String> {
        let tokens = self.tokens.as_ref()?;
        match tokens.get_token(&self.server).await {
            Ok(token) => token.map(|t| t.authorization_header()),
            Err(e) => {
                warn!(server = %self.server, error = %e, "Failed to read OAuth token");
                None
            }
        }
    }

    /// Send a request; returns the result and any session header.
    async fn exchange(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(Value, Option<String>), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        let response = self.post(body).await?;

        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let text = response.text().await.map_err(map_reqwest)?;
        let parsed = if is_sse {
            parse_sse_response(&text, id)?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text)?
        };
        Ok((parsed.into_result()?, session_id))
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError> {
        if !self.supports_tools {
            return Ok(Vec::new());
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let (result, _) = self
                .exchange("tools/list", jsonrpc::tools_list_params(cursor.as_deref()))
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
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(session_id) = self.session_id.take() else {
            return;
        };
        let result = self
            .client
            .delete(&self.url)
            .timeout(CLOSE_TIMEOUT)
            .header(SESSION_HEADER, session_id)
            .send()
            .await;
        if let Err(e) = result {
            debug!(server = %self.server, error = %e, "Session DELETE failed");
        }
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

async fn http_error(response: reqwest::Response) -> TransportError {
    let status = response.status().as_u16();
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    TransportError::Http { status, message }
}

/// Extract the `resource_metadata` parameter from a `WWW-Authenticate` header.
pub fn parse_resource_metadata(header: &str) -> Option<String> {
    let start = header.find("resource_metadata=")? + "resource_metadata=".len();
    let rest = &header[start..];
    let value = if let Some(quoted) = rest.strip_prefix('"') {
        &quoted[..quoted.find('"')?]
    } else {
        rest.split(|c: char| c == ',' || c.is_whitespace())
            .next()
            .unwrap_or_default()
    };
    (!value.is_empty()).then(|| value.to_string())
}

/// Find the response to request `id` in an SSE-framed body.
pub fn parse_sse_response(body: &str, id: u64) -> Result<JsonRpcResponse, TransportError> {
    let mut data = String::new();
    let mut events: Vec<String> = Vec::new();

    for line in body.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !data.is_empty() {
                events.push(std::mem::take(&mut data));
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    events
        .iter()
        .filter_map(|event| serde_json::from_str::<JsonRpcResponse>(event).ok())
        .find(|response| response.answers(id))
        .ok_or_else(|| TransportError::Protocol("no JSON-RPC response in event stream".to_string()))
}
