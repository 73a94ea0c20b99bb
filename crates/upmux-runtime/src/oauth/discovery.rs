//! OAuth metadata discovery.
//!
//! 1. Protected resource metadata (RFC 9728): the `resource_metadata` hint
//!    from a 401, then the path-aware well-known URL, then the root one.
//! 2. Authorization server metadata: RFC 8414 path insertion, OIDC, the
//!    legacy appended form, then the bare origin.
//! 3. If nothing answers, conventional `/authorize`, `/token` and
//!    `/register` endpoints on the issuer origin.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};
use upmux_core::AuthError;
use url::Url;

const PRM_WELL_KNOWN: &str = "/.well-known/oauth-protected-resource";
const AS_WELL_KNOWN: &str = "/.well-known/oauth-authorization-server";
const OIDC_WELL_KNOWN: &str = "/.well-known/openid-configuration";

/// Per-request timeout for metadata fetches.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// RFC 9728 protected resource metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// RFC 8414 authorization server metadata (the fields we use).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// Everything the authorization-code flow needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoints {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
    /// Scopes advertised by the resource, falling back to the server's.
    pub scopes: Vec<String>,
    /// RFC 8707 resource indicator from the protected resource metadata.
    pub resource: Option<String>,
}

fn origin(url: &Url) -> String {
    url.origin().ascii_serialization()
}

fn trimmed_path(url: &Url) -> &str {
    url.path().trim_end_matches('/')
}

/// Candidate protected-resource metadata URLs for a server URL.
pub fn protected_resource_urls(server_url: &Url) -> Vec<String> {
    let base = origin(server_url);
    let path = trimmed_path(server_url);
    let mut urls = Vec::with_capacity(2);
    if !path.is_empty() {
        urls.push(format!("{base}{PRM_WELL_KNOWN}{path}"));
    }
    urls.push(format!("{base}{PRM_WELL_KNOWN}"));
    urls
}

/// Candidate authorization-server metadata URLs for an issuer, in order.
pub fn auth_server_metadata_urls(issuer: &Url) -> Vec<String> {
    let base = origin(issuer);
    let path = trimmed_path(issuer);
    let mut urls = Vec::new();
    if path.is_empty() {
        urls.push(format!("{base}{AS_WELL_KNOWN}"));
        urls.push(format!("{base}{OIDC_WELL_KNOWN}"));
    } else {
        urls.push(format!("{base}{AS_WELL_KNOWN}{path}"));
        urls.push(format!("{base}{OIDC_WELL_KNOWN}{path}"));
        urls.push(format!("{base}{path}{AS_WELL_KNOWN}"));
        urls.push(format!("{base}{path}{OIDC_WELL_KNOWN}"));
        urls.push(format!("{base}{AS_WELL_KNOWN}"));
    }
    urls
}

/// Conventional endpoints when no metadata is published.
pub fn fallback_endpoints(issuer: &Url) -> DiscoveredEndpoints {
    let base = origin(issuer);
    DiscoveredEndpoints {
        issuer: base.clone(),
        authorization_endpoint: format!("{base}/authorize"),
        token_endpoint: format!("{base}/token"),
        registration_endpoint: Some(format!("{base}/register")),
        scopes: Vec::new(),
        resource: None,
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Option<T> {
    let response = match http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .timeout(DISCOVERY_TIMEOUT)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            debug!(url = %url, error = %e, "Metadata request failed");
            return None;
        }
    };
    if !response.status().is_success() {
        debug!(url = %url, status = %response.status(), "Metadata not found");
        return None;
    }
    match response.json::<T>().await {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(url = %url, error = %e, "Metadata did not parse");
            None
        }
    }
}

/// Fetch protected-resource metadata, trying the hint first.
pub async fn discover_protected_resource(
    http: &reqwest::Client,
    server_url: &Url,
    hint: Option<&str>,
) -> Option<ProtectedResourceMetadata> {
    let candidates = hint
        .map(str::to_string)
        .into_iter()
        .chain(protected_resource_urls(server_url));
    for url in candidates {
        if let Some(metadata) = fetch_json::<ProtectedResourceMetadata>(http, &url).await {
            debug!(url = %url, servers = ?metadata.authorization_servers, "Found protected resource metadata");
            return Some(metadata);
        }
    }
    None
}

/// Resolve every endpoint the flow needs for `server_url`.
pub async fn discover(
    http: &reqwest::Client,
    server_url: &str,
    hint: Option<&str>,
) -> Result<DiscoveredEndpoints, AuthError> {
    let server_url = Url::parse(server_url)
        .map_err(|e| AuthError::Discovery(format!("invalid server url '{server_url}': {e}")))?;

    let prm = discover_protected_resource(http, &server_url, hint)
        .await
        .unwrap_or_default();

    let issuer = match prm.authorization_servers.first() {
        Some(issuer) => Url::parse(issuer)
            .map_err(|e| AuthError::Discovery(format!("invalid authorization server '{issuer}': {e}")))?,
        None => server_url.clone(),
    };

    for url in auth_server_metadata_urls(&issuer) {
        if let Some(metadata) = fetch_json::<AuthServerMetadata>(http, &url).await {
            info!(
                metadata_url = %url,
                token_endpoint = %metadata.token_endpoint,
                "Discovered OAuth authorization server"
            );
            let scopes = if prm.scopes_supported.is_empty() {
                metadata.scopes_supported
            } else {
                prm.scopes_supported
            };
            return Ok(DiscoveredEndpoints {
                issuer: metadata.issuer.unwrap_or_else(|| issuer.to_string()),
                authorization_endpoint: metadata.authorization_endpoint,
                token_endpoint: metadata.token_endpoint,
                registration_endpoint: metadata.registration_endpoint,
                scopes,
                resource: prm.resource,
            });
        }
    }

    warn!(issuer = %issuer, "No OAuth metadata published, using conventional endpoints");
    let mut endpoints = fallback_endpoints(&issuer);
    endpoints.scopes = prm.scopes_supported;
    endpoints.resource = prm.resource;
    Ok(endpoints)
}
