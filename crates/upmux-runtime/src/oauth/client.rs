//! OAuth 2.1 client for upstream servers.
//!
//! Drives the interactive authorization-code + PKCE flow and the
//! refresh-token grant. Tokens are persisted through the [`TokenStore`]
//! port together with the client registration needed to refresh them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use upmux_core::{AuthError, OAuthSettings, OAuthToken, ServerConfig, TokenStore};
use url::Url;

use super::Authenticator;
use super::callback::CallbackListener;
use super::coordinator::OAuthFlowCoordinator;
use super::discovery::{self, DiscoveredEndpoints};
use super::pkce::PkceChallenge;

/// How long the user has to finish the browser step.
pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const CLIENT_NAME: &str = "upmux";

/// Opens the authorization URL for the user.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<(), String>;
}

/// Launches the system browser.
#[derive(Debug, Default, Clone)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> Result<(), String> {
        open::that(url).map_err(|e| e.to_string())
    }
}

/// Token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Token endpoint error body (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: Vec<&'a str>,
    grant_types: [&'a str; 2],
    response_types: [&'a str; 1],
    token_endpoint_auth_method: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

/// OAuth client shared by the actors, the refresh executor and the CLI.
pub struct OAuthClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenStore>,
    flows: Arc<OAuthFlowCoordinator>,
    browser: Arc<dyn BrowserOpener>,
    flow_timeout: Duration,
}

impl OAuthClient {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        flows: Arc<OAuthFlowCoordinator>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            tokens,
            flows,
            browser: Arc::new(SystemBrowser),
            flow_timeout: DEFAULT_FLOW_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_browser(mut self, browser: Arc<dyn BrowserOpener>) -> Self {
        self.browser = browser;
        self
    }

    #[must_use]
    pub const fn with_flow_timeout(mut self, timeout: Duration) -> Self {
        self.flow_timeout = timeout;
        self
    }

    pub fn flows(&self) -> &Arc<OAuthFlowCoordinator> {
        &self.flows
    }

    /// Run the interactive flow for `server` and persist the result.
    pub async fn login(
        &self,
        server: &ServerConfig,
        resource_metadata: Option<&str>,
    ) -> Result<OAuthToken, AuthError> {
        let settings = server
            .oauth
            .as_ref()
            .ok_or_else(|| AuthError::NotOAuth(server.name.clone()))?;
        let server_url = server
            .url
            .as_deref()
            .ok_or_else(|| AuthError::NotOAuth(server.name.clone()))?;

        let _flow = self.flows.try_begin(&server.name)?;
        info!(server = %server.name, "Starting OAuth authorization flow");

        let endpoints = discovery::discover(&self.http, server_url, resource_metadata).await?;
        let mut listener = CallbackListener::bind(settings.redirect_uri.as_deref()).await?;
        let redirect_uri = listener.redirect_uri().to_string();

        let (client_id, client_secret) = match &settings.client_id {
            Some(id) => (id.clone(), settings.client_secret.clone()),
            None => self.register(&server.name, &endpoints, &redirect_uri).await?,
        };

        let pkce = settings.pkce_enabled.then(PkceChallenge::generate);
        let state = uuid::Uuid::new_v4().simple().to_string();
        let authorize_url = build_authorize_url(
            &endpoints,
            settings,
            &client_id,
            &redirect_uri,
            &state,
            pkce.as_ref(),
        )?;

        if let Err(e) = self.browser.open(&authorize_url) {
            warn!(server = %server.name, error = %e, "Could not open browser");
        }
        info!(server = %server.name, url = %authorize_url, "Waiting for OAuth authorization in browser");

        let params = tokio::time::timeout(self.flow_timeout, listener.wait())
            .await
            .map_err(|_| AuthError::Timeout)??;
        let code = params.into_code(&state)?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id.clone()),
        ];
        if let Some(pkce) = &pkce {
            form.push(("code_verifier", pkce.verifier.clone()));
        }
        if let Some(secret) = &client_secret {
            form.push(("client_secret", secret.clone()));
        }
        push_resource(&mut form, settings, endpoints.resource.as_deref());

        let response = self.token_request(&endpoints.token_endpoint, &form).await?;
        let mut token = into_token(response, None);
        token.client_id = Some(client_id);
        token.client_secret = client_secret;
        token.token_endpoint = Some(endpoints.token_endpoint.clone());

        self.tokens.save_token(&server.name, &token).await?;
        info!(
            server = %server.name,
            expires_at = ?token.expires_at,
            has_refresh_token = token.has_refresh_token(),
            "OAuth authorization complete"
        );
        Ok(token)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// The returned token is not persisted; the caller decides.
    pub async fn exchange_refresh_token(
        &self,
        server: &ServerConfig,
        current: &OAuthToken,
    ) -> Result<OAuthToken, AuthError> {
        let settings = server
            .oauth
            .as_ref()
            .ok_or_else(|| AuthError::NotOAuth(server.name.clone()))?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::LoginRequired(server.name.clone()))?;

        let (token_endpoint, resource) = match &current.token_endpoint {
            Some(endpoint) => (endpoint.clone(), None),
            None => {
                let url = server
                    .url
                    .as_deref()
                    .ok_or_else(|| AuthError::NotOAuth(server.name.clone()))?;
                let endpoints = discovery::discover(&self.http, url, None).await?;
                (endpoints.token_endpoint, endpoints.resource)
            }
        };

        let client_id = current
            .client_id
            .clone()
            .or_else(|| settings.client_id.clone());
        let client_secret = current
            .client_secret
            .clone()
            .or_else(|| settings.client_secret.clone());

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
        ];
        if let Some(id) = &client_id {
            form.push(("client_id", id.clone()));
        }
        if let Some(secret) = &client_secret {
            form.push(("client_secret", secret.clone()));
        }
        push_resource(&mut form, settings, resource.as_deref());

        debug!(server = %server.name, endpoint = %token_endpoint, "Refreshing OAuth token");
        let response = self.token_request(&token_endpoint, &form).await?;
        let mut token = into_token(response, Some(refresh_token));
        token.client_id = client_id;
        token.client_secret = client_secret;
        token.token_endpoint = Some(token_endpoint);
        Ok(token)
    }

    async fn register(
        &self,
        server: &str,
        endpoints: &DiscoveredEndpoints,
        redirect_uri: &str,
    ) -> Result<(String, Option<String>), AuthError> {
        let endpoint = endpoints.registration_endpoint.as_deref().ok_or_else(|| {
            AuthError::Registration(format!(
                "{server}: no client_id configured and no registration endpoint advertised"
            ))
        })?;

        let request = RegistrationRequest {
            client_name: CLIENT_NAME,
            redirect_uris: vec![redirect_uri],
            grant_types: ["authorization_code", "refresh_token"],
            response_types: ["code"],
            token_endpoint_auth_method: "none",
        };
        let response = self
            .http
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Registration(format!("HTTP {status}: {body}")));
        }
        let registered: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Registration(e.to_string()))?;
        info!(server = %server, client_id = %registered.client_id, "Registered OAuth client");
        Ok((registered.client_id, registered.client_secret))
    }

    async fn token_request(
        &self,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<TokenResponse, AuthError> {
        let response = self
            .http
            .post(endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthError::Timeout
                } else {
                    AuthError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<TokenErrorBody>(&body) {
                Ok(err) if err.error == "invalid_grant" => AuthError::InvalidGrant(
                    err.error_description.unwrap_or(err.error),
                ),
                Ok(err) => AuthError::TokenEndpoint {
                    status: status.as_u16(),
                    message: match err.error_description {
                        Some(desc) => format!("{}: {desc}", err.error),
                        None => err.error,
                    },
                },
                Err(_) => AuthError::TokenEndpoint {
                    status: status.as_u16(),
                    message: body,
                },
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| AuthError::Other(format!("malformed token response: {e}")))
    }
}

fn into_token(response: TokenResponse, previous_refresh: Option<String>) -> OAuthToken {
    let mut token = OAuthToken::bearer(response.access_token, response.expires_in);
    if let Some(kind) = response.token_type {
        token.token_type = kind;
    }
    // Servers that do not rotate refresh tokens omit them on refresh.
    token.refresh_token = response.refresh_token.or(previous_refresh);
    token.scope = response.scope;
    token
}

fn push_resource(
    form: &mut Vec<(&'static str, String)>,
    settings: &OAuthSettings,
    discovered: Option<&str>,
) {
    if let Some(resource) = settings
        .extra_params
        .get("resource")
        .cloned()
        .or_else(|| discovered.map(str::to_string))
    {
        form.push(("resource", resource));
    }
}

fn build_authorize_url(
    endpoints: &DiscoveredEndpoints,
    settings: &OAuthSettings,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    pkce: Option<&PkceChallenge>,
) -> Result<String, AuthError> {
    let mut url = Url::parse(&endpoints.authorization_endpoint).map_err(|e| {
        AuthError::Discovery(format!(
            "invalid authorization endpoint '{}': {e}",
            endpoints.authorization_endpoint
        ))
    })?;

    let scopes = if settings.scopes.is_empty() {
        &endpoints.scopes
    } else {
        &settings.scopes
    };

    let mut extra: BTreeMap<&str, &str> = settings
        .extra_params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    if let Some(resource) = &endpoints.resource {
        extra.entry("resource").or_insert(resource.as_str());
    }

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        if !scopes.is_empty() {
            query.append_pair("scope", &scopes.join(" "));
        }
        if let Some(pkce) = pkce {
            query
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", PkceChallenge::METHOD);
        }
        for (key, value) in extra {
            query.append_pair(key, value);
        }
    }
    Ok(url.into())
}

#[async_trait]
impl Authenticator for OAuthClient {
    async fn authenticate(
        &self,
        server: &ServerConfig,
        resource_metadata: Option<&str>,
    ) -> Result<OAuthToken, AuthError> {
        self.login(server, resource_metadata).await
    }
}
