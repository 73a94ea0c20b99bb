//! Login command handler.
//!
//! Runs the interactive OAuth flow outside the supervisor. A running
//! `upmux serve` picks the stored token up on its next connect.

use anyhow::Result;
use upmux_core::{AuthError, ConfigSource};

use crate::bootstrap::CliContext;
use crate::error::CliError;

pub async fn execute(ctx: &CliContext, server: &str) -> Result<()> {
    let config = ctx
        .config
        .find_server(server)
        .ok_or_else(|| CliError::UnknownServer(server.to_string()))?;
    if !config.uses_oauth() {
        return Err(CliError::from(AuthError::NotOAuth(server.to_string())).into());
    }

    println!("Opening browser to authorize {server}...");
    let token = ctx.oauth.login(&config, None).await.map_err(CliError::from)?;

    match token.expires_at {
        Some(at) => println!("Logged in to {server} (token expires {at})"),
        None => println!("Logged in to {server}"),
    }
    if !token.has_refresh_token() {
        println!("No refresh token was issued; you will need to log in again after expiry.");
    }
    Ok(())
}
