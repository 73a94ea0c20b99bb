//! Loopback redirect listener for the authorization-code flow.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use upmux_core::AuthError;
use url::Url;

const DEFAULT_CALLBACK_PATH: &str = "/oauth/callback";

/// Query parameters delivered to the redirect URI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// The authorization code, if `state` matches and no error was returned.
    pub fn into_code(self, expected_state: &str) -> Result<String, AuthError> {
        if let Some(error) = self.error {
            let detail = self.error_description.unwrap_or_default();
            return Err(AuthError::Other(format!(
                "authorization denied: {error} {detail}"
            )));
        }
        if self.state.as_deref() != Some(expected_state) {
            return Err(AuthError::Other(
                "OAuth state mismatch in callback".to_string(),
            ));
        }
        self.code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::Other("callback carried no authorization code".to_string()))
    }
}

/// A running loopback server waiting for one redirect.
///
/// Dropping the listener shuts the server down.
pub struct CallbackListener {
    redirect_uri: String,
    rx: mpsc::Receiver<CallbackParams>,
    cancel: CancellationToken,
}

impl CallbackListener {
    /// Bind the listener.
    ///
    /// A configured redirect URI must point at a loopback host; its port and
    /// path are honoured. Without one, an ephemeral port is chosen.
    pub async fn bind(configured: Option<&str>) -> Result<Self, AuthError> {
        let (addr, host, path) = match configured {
            Some(uri) => parse_redirect(uri)?,
            None => (
                SocketAddr::from(([127, 0, 0, 1], 0)),
                "127.0.0.1".to_string(),
                DEFAULT_CALLBACK_PATH.to_string(),
            ),
        };

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AuthError::Other(format!("cannot bind OAuth callback on {addr}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::Other(e.to_string()))?
            .port();
        let redirect_uri = format!("http://{host}:{port}{path}");

        let (tx, rx) = mpsc::channel(1);
        let app = Router::new()
            .route(&path, get(handle_callback))
            .with_state(tx);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %e, "OAuth callback server error");
            }
        });

        debug!(redirect_uri = %redirect_uri, "OAuth callback listener started");
        Ok(Self {
            redirect_uri,
            rx,
            cancel,
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Wait for the first redirect.
    pub async fn wait(&mut self) -> Result<CallbackParams, AuthError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| AuthError::Other("OAuth callback listener closed".to_string()))
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn parse_redirect(uri: &str) -> Result<(SocketAddr, String, String), AuthError> {
    let invalid = |reason: &str| AuthError::Other(format!("invalid redirect_uri '{uri}': {reason}"));
    let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?.to_string();
    let ip = match host.as_str() {
        "localhost" | "127.0.0.1" => [127, 0, 0, 1],
        _ => return Err(invalid("host must be localhost or 127.0.0.1")),
    };
    let port = url.port().unwrap_or(0);
    let path = match url.path() {
        "" | "/" => DEFAULT_CALLBACK_PATH.to_string(),
        p => p.to_string(),
    };
    Ok((SocketAddr::from((ip, port)), host, path))
}

async fn handle_callback(
    State(tx): State<mpsc::Sender<CallbackParams>>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let failed = params.error.is_some();
    if tx.try_send(params).is_err() {
        debug!("Ignoring duplicate OAuth callback");
    }
    if failed {
        Html("<html><body><h3>Authorization failed.</h3><p>Return to your terminal for details.</p></body></html>")
    } else {
        Html("<html><body><h3>Authorization complete.</h3><p>You can close this window.</p></body></html>")
    }
}
