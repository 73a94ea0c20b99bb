//! The per-server connection state machine.
//!
//! One task owns a `Machine` and processes one command (or retry) at a
//! time, so transitions for a server are strictly sequential. Every
//! transition is published to the state view and the actor's watch channel
//! before the next one starts.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use upmux_core::{
    AuthError, ConnectionStatus, ContainerState, ManagedContainer, OAuthState, OAuthStatus,
    OAuthToken, ResourceError, ServerConfig, ServerStatus, Session, ToolInfo, Transport,
    TransportError, UpstreamEvent, truncate_error,
};

use super::ActorDeps;
use super::command::ActorCommand;
use crate::error::ConnectFailure;

/// Initial status for a freshly started actor.
pub fn initial_status(config: &ServerConfig) -> ServerStatus {
    let mut status = ServerStatus::new(&config.name, config.enabled, config.quarantined);
    if config.uses_oauth() {
        status.oauth = Some(OAuthState::default());
    }
    status
}

pub struct Machine {
    config: Arc<ServerConfig>,
    epoch: u64,
    deps: ActorDeps,
    transport: Arc<dyn Transport>,
    status: ServerStatus,
    status_tx: watch::Sender<ServerStatus>,
    cancel: CancellationToken,
    session: Option<Box<dyn Session>>,
    container: Option<ManagedContainer>,
    /// The server should be up; retries only run while this holds.
    desired: bool,
    /// Next scheduled retry.
    retry_at: Option<Instant>,
    /// Next liveness check; set only while ready.
    health_at: Option<Instant>,
    /// Run the interactive OAuth flow even if a token is stored.
    force_auth: bool,
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Machine {
    pub fn new(
        config: Arc<ServerConfig>,
        epoch: u64,
        deps: ActorDeps,
        status: ServerStatus,
        status_tx: watch::Sender<ServerStatus>,
        cancel: CancellationToken,
    ) -> Self {
        let transport = deps.transports.transport_for(config.transport_kind());
        Self {
            config,
            epoch,
            deps,
            transport,
            status,
            status_tx,
            cancel,
            session: None,
            container: None,
            desired: false,
            retry_at: None,
            health_at: None,
            force_auth: false,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<ActorCommand>) {
        debug!(server = %self.config.name, epoch = self.epoch, "Connection actor started");
        loop {
            let retry_at = self.retry_at;
            let health_at = self.health_at;
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                () = wait_until(retry_at) => {
                    self.retry_at = None;
                    if self.desired {
                        debug!(server = %self.config.name, retry_count = self.status.connection.retry_count, "Retrying connection");
                        self.connect().await;
                    }
                }
                () = wait_until(health_at) => {
                    self.health_at = None;
                    self.health_check().await;
                }
            }
        }

        let was_connected = self.session.is_some();
        self.release().await;
        self.status.clear_tools();
        self.status.connection.should_retry = false;
        self.transition(ConnectionStatus::Stopped, None);
        if was_connected {
            self.deps.events.emit(UpstreamEvent::ServerDisconnected {
                server: self.config.name.clone(),
                reason: Some("stopped".to_string()),
            });
        }
        debug!(server = %self.config.name, "Connection actor stopped");
    }

    async fn handle(&mut self, command: ActorCommand) {
        match command {
            ActorCommand::Connect => {
                self.desired = true;
                if !self.status.is_ready() {
                    self.connect().await;
                }
            }
            ActorCommand::Disconnect => self.disconnect(Some("disabled".to_string())).await,
            ActorCommand::UpdateConfig(config) => self.update_config(config).await,
            ActorCommand::Login => self.login().await,
            ActorCommand::Logout => self.logout().await,
            ActorCommand::AuthFailed { error } => self.auth_failed(&error).await,
            ActorCommand::TokenRefreshed { expires_at } => {
                self.update_oauth(|oauth| {
                    oauth.token_expires_at = expires_at;
                    oauth.status = OAuthStatus::Authenticated;
                    oauth.retry_count = 0;
                    oauth.last_error = None;
                });
                self.publish();
            }
        }
    }

    // Transitions ---------------------------------------------------------

    fn publish(&mut self) {
        self.status.updated_at = Utc::now();
        if !self.deps.state.publish_as(self.epoch, self.status.clone()) {
            debug!(server = %self.config.name, epoch = self.epoch, "State view entry owned by a newer actor");
        }
        self.status_tx.send_replace(self.status.clone());
    }

    fn transition(&mut self, to: ConnectionStatus, error: Option<String>) {
        let from = self.status.status();
        self.status.connection.status = to;
        match &error {
            Some(message) => self.status.set_error(message),
            None if to != ConnectionStatus::Error => self.status.connection.last_error = None,
            None => {}
        }
        self.publish();

        if from != to || error.is_some() {
            debug!(server = %self.config.name, %from, %to, "Connection state changed");
            self.deps.events.emit(UpstreamEvent::state_changed(
                self.config.name.clone(),
                from,
                to,
                error.as_deref().map(truncate_error),
            ));
        }
    }

    fn update_oauth(&mut self, f: impl FnOnce(&mut OAuthState)) {
        if let Some(oauth) = self.status.oauth.as_mut() {
            f(oauth);
        }
    }

    fn user_logged_out(&self) -> bool {
        self.status.oauth.as_ref().is_some_and(|o| o.user_logged_out)
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, ConnectFailure> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ConnectFailure::Cancelled),
            out = fut => Ok(out),
        }
    }

    // Connect -------------------------------------------------------------

    async fn connect(&mut self) {
        self.retry_at = None;
        match self.try_connect().await {
            Ok(()) => {}
            Err(ConnectFailure::Cancelled) => self.release().await,
            Err(failure) => self.on_connect_failure(failure).await,
        }
    }

    async fn try_connect(&mut self) -> Result<(), ConnectFailure> {
        self.config.validate()?;
        self.release().await;
        self.transition(ConnectionStatus::Connecting, None);

        let effective = self.prepare_sandbox().await?;

        if self.config.uses_oauth() {
            self.ensure_token().await?;
        }

        let session = match self.dial(&effective).await {
            Err(ConnectFailure::Transport(TransportError::Unauthorized { resource_metadata }))
                if self.config.uses_oauth() =>
            {
                info!(server = %self.config.name, "Upstream requires authorization");
                self.interactive_auth(resource_metadata.as_deref()).await?;
                self.dial(&effective).await?
            }
            other => other?,
        };
        self.session = Some(session);

        let tools = {
            let session = self
                .session
                .as_deref()
                .ok_or(ConnectFailure::Transport(TransportError::Closed))?;
            let timeout = self.deps.settings.connect_timeout;
            match self
                .cancellable(tokio::time::timeout(timeout, session.list_tools()))
                .await?
            {
                Ok(result) => result?,
                Err(_) => return Err(ConnectFailure::Timeout(timeout.as_secs())),
            }
        };

        let now = Utc::now();
        self.status.set_tools(tools);
        self.status.connection.retry_count = 0;
        self.status.connection.should_retry = false;
        self.status.connection.connected_at = Some(now);
        self.update_oauth(|oauth| {
            oauth.status = OAuthStatus::Authenticated;
            oauth.retry_count = 0;
            oauth.last_error = None;
        });
        self.transition(ConnectionStatus::Ready, None);
        self.schedule_health_check();

        info!(server = %self.config.name, tool_count = self.status.tool_count, "Upstream connected");
        self.deps.events.emit(UpstreamEvent::ServerConnected {
            server: self.config.name.clone(),
            tool_count: self.status.tool_count,
        });
        Ok(())
    }

    /// Start the sandbox if isolation applies and return the config the
    /// transport should actually run.
    async fn prepare_sandbox(&mut self) -> Result<ServerConfig, ConnectFailure> {
        let mut effective = (*self.config).clone();
        let defaults = self.deps.isolation.load_full();
        if !self.config.isolation_enabled(&defaults) {
            return Ok(effective);
        }
        // A missing image is a config problem, not a sandbox one.
        defaults.image_for(&self.config)?;

        let sandbox = self.deps.sandbox.clone().ok_or_else(|| {
            ResourceError::Unavailable("isolation enabled but no sandbox runtime configured".to_string())
        })?;
        let container = self
            .cancellable(sandbox.create_labeled(&self.config, &defaults))
            .await??;

        effective.command = Some(container.launch.program.clone());
        effective.args.clone_from(&container.launch.args);
        // Env and working dir are applied inside the container.
        effective.env.clear();
        effective.working_dir = None;

        debug!(server = %self.config.name, container = %container.container_name, "Sandbox container prepared");
        self.container = Some(container);
        Ok(effective)
    }

    async fn dial(&self, config: &ServerConfig) -> Result<Box<dyn Session>, ConnectFailure> {
        let timeout = self.deps.settings.connect_timeout;
        match self
            .cancellable(tokio::time::timeout(timeout, self.transport.connect(config)))
            .await?
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectFailure::Timeout(timeout.as_secs())),
        }
    }

    async fn on_connect_failure(&mut self, failure: ConnectFailure) {
        self.release().await;
        self.status.clear_tools();

        let message = failure.to_string();
        if let ConnectFailure::Auth(err) = &failure {
            let terminal = err.is_terminal();
            self.update_oauth(|oauth| {
                oauth.status = OAuthStatus::Error;
                oauth.last_error = Some(truncate_error(&message));
                if !terminal {
                    oauth.retry_count = oauth.retry_count.saturating_add(1);
                }
            });
        }

        let connection = &mut self.status.connection;
        connection.retry_count = connection.retry_count.saturating_add(1);
        connection.last_retry_at = Some(Utc::now());

        let retry = self.desired && failure.is_retryable();
        if retry {
            let delay = self
                .deps
                .settings
                .backoff
                .delay_for(connection.retry_count - 1);
            self.retry_at = Some(Instant::now() + delay);
            connection.should_retry = true;
            warn!(
                server = %self.config.name,
                error = %message,
                retry_count = connection.retry_count,
                retry_in_ms = delay.as_millis(),
                "Upstream connect failed, will retry"
            );
        } else {
            connection.should_retry = false;
            warn!(
                server = %self.config.name,
                error = %message,
                retry_count = connection.retry_count,
                "Upstream connect failed, not retrying"
            );
        }

        self.transition(ConnectionStatus::Error, Some(message));
    }

    // Health ---------------------------------------------------------------

    fn schedule_health_check(&mut self) {
        self.health_at = Some(Instant::now() + self.deps.settings.health_check_interval);
    }

    async fn health_check(&mut self) {
        if !self.status.is_ready() {
            return;
        }
        match self.probe_health().await {
            Ok(tools) => {
                if tools.len() != self.status.tool_count {
                    info!(server = %self.config.name, from = self.status.tool_count, to = tools.len(), "Upstream tool list changed");
                    self.status.set_tools(tools);
                    self.publish();
                }
                self.schedule_health_check();
            }
            Err(ConnectFailure::Cancelled) => {}
            Err(failure) => {
                warn!(server = %self.config.name, error = %failure, "Upstream health check failed");
                self.status.connection.connected_at = None;
                self.deps.events.emit(UpstreamEvent::ServerDisconnected {
                    server: self.config.name.clone(),
                    reason: Some(format!("health check failed: {failure}")),
                });
                self.on_connect_failure(failure).await;
            }
        }
    }

    /// Confirm the sandbox container and the session are still up, and
    /// return the current tool list.
    async fn probe_health(&self) -> Result<Vec<ToolInfo>, ConnectFailure> {
        if let (Some(container), Some(sandbox)) = (&self.container, &self.deps.sandbox) {
            match self.cancellable(sandbox.inspect(container)).await? {
                Ok(ContainerState::Exited | ContainerState::Missing) => {
                    return Err(ResourceError::NotRunning {
                        container: container.container_name.clone(),
                    }
                    .into());
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(server = %self.config.name, error = %e, "Container inspect failed, relying on session check");
                }
            }
        }

        let session = self
            .session
            .as_deref()
            .ok_or(ConnectFailure::Transport(TransportError::Closed))?;
        if !session.is_alive() {
            return Err(TransportError::Closed.into());
        }
        let timeout = self.deps.settings.connect_timeout;
        match self
            .cancellable(tokio::time::timeout(timeout, session.list_tools()))
            .await?
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectFailure::Timeout(timeout.as_secs())),
        }
    }

    // OAuth ---------------------------------------------------------------

    async fn ensure_token(&mut self) -> Result<(), ConnectFailure> {
        if self.force_auth {
            self.force_auth = false;
            return self.interactive_auth(None).await;
        }
        if self.user_logged_out() {
            return Err(AuthError::LoginRequired(self.config.name.clone()).into());
        }

        let stored = self
            .deps
            .tokens
            .get_token(&self.config.name)
            .await
            .map_err(AuthError::from)?;

        match stored {
            Some(token) if !token.is_expired() => {
                self.record_token(&token);
                Ok(())
            }
            Some(token) if token.has_refresh_token() => {
                self.update_oauth(|oauth| oauth.status = OAuthStatus::Expired);
                let Some(refresh) = self.deps.refresh.clone() else {
                    return self.interactive_auth(None).await;
                };
                match self.cancellable(refresh.refresh_now(&self.config.name)).await? {
                    Ok(token) => {
                        debug!(server = %self.config.name, "Refreshed expired token before connect");
                        self.record_token(&token);
                        Ok(())
                    }
                    Err(e) if e.is_terminal() => {
                        info!(server = %self.config.name, error = %e, "Stored refresh token rejected, re-authenticating");
                        self.interactive_auth(None).await
                    }
                    Err(e) => Err(e.into()),
                }
            }
            // No usable token: let the upstream decide with a 401.
            _ => Ok(()),
        }
    }

    async fn interactive_auth(&mut self, resource_metadata: Option<&str>) -> Result<(), ConnectFailure> {
        let name = self.config.name.clone();
        if self.user_logged_out() {
            return Err(AuthError::LoginRequired(name).into());
        }
        let Some(authenticator) = self.deps.authenticator.clone() else {
            return Err(AuthError::LoginRequired(name).into());
        };

        self.update_oauth(|oauth| {
            oauth.status = OAuthStatus::Authenticating;
            oauth.last_attempt = Some(Utc::now());
        });
        self.transition(ConnectionStatus::Authenticating, None);

        let config = Arc::clone(&self.config);
        let token = self
            .cancellable(authenticator.authenticate(&config, resource_metadata))
            .await??;

        self.record_token(&token);
        if let Some(refresh) = &self.deps.refresh {
            refresh.on_token_saved(&name, token.expires_at);
        }
        info!(server = %name, "OAuth authentication complete");
        Ok(())
    }

    fn record_token(&mut self, token: &OAuthToken) {
        self.update_oauth(|oauth| {
            oauth.token_expires_at = token.expires_at;
            oauth.has_refresh_token = token.has_refresh_token();
        });
    }

    async fn login(&mut self) {
        if !self.config.uses_oauth() {
            warn!(server = %self.config.name, "Login requested for a server without OAuth");
            return;
        }
        info!(server = %self.config.name, "Explicit login requested");
        self.update_oauth(|oauth| {
            oauth.user_logged_out = false;
            oauth.last_error = None;
        });
        self.force_auth = true;
        self.desired = true;
        self.connect().await;
    }

    async fn logout(&mut self) {
        if !self.config.uses_oauth() {
            warn!(server = %self.config.name, "Logout requested for a server without OAuth");
            return;
        }
        info!(server = %self.config.name, "Explicit logout requested");
        if let Err(e) = self.deps.tokens.delete_token(&self.config.name).await {
            warn!(server = %self.config.name, error = %e, "Failed to delete stored token");
        }
        if let Some(refresh) = &self.deps.refresh {
            refresh.on_token_cleared(&self.config.name);
        }
        self.update_oauth(|oauth| {
            *oauth = OAuthState {
                user_logged_out: true,
                ..OAuthState::default()
            };
        });
        self.disconnect(Some("logged out".to_string())).await;
    }

    async fn auth_failed(&mut self, error: &str) {
        warn!(server = %self.config.name, error = %error, "OAuth refresh failed permanently");
        self.update_oauth(|oauth| {
            oauth.status = OAuthStatus::Error;
            oauth.last_error = Some(truncate_error(error));
        });

        // Ready requires a valid OAuth state, so a live connection must drop.
        let active = self.session.is_some()
            || matches!(
                self.status.status(),
                ConnectionStatus::Connecting | ConnectionStatus::Authenticating
            );
        self.retry_at = None;
        self.status.connection.should_retry = false;
        if active {
            self.release().await;
            self.status.clear_tools();
            self.transition(
                ConnectionStatus::Error,
                Some(format!("OAuth refresh failed: {error}")),
            );
        } else {
            self.publish();
        }
    }

    // Teardown ------------------------------------------------------------

    async fn disconnect(&mut self, reason: Option<String>) {
        self.desired = false;
        self.retry_at = None;
        let was_connected = self.session.is_some();
        self.release().await;

        self.status.clear_tools();
        self.status.connection.retry_count = 0;
        self.status.connection.should_retry = false;
        self.status.connection.connected_at = None;
        self.transition(ConnectionStatus::Disconnected, None);

        if was_connected {
            info!(server = %self.config.name, reason = ?reason, "Upstream disconnected");
            self.deps.events.emit(UpstreamEvent::ServerDisconnected {
                server: self.config.name.clone(),
                reason,
            });
        }
    }

    /// Close the session and stop the sandbox container, if any.
    async fn release(&mut self) {
        self.health_at = None;
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        if let Some(container) = self.container.take() {
            let Some(sandbox) = self.deps.sandbox.clone() else {
                return;
            };
            if let Err(e) = sandbox.stop(&container).await {
                warn!(
                    server = %self.config.name,
                    container = %container.container_name,
                    error = %e,
                    "Failed to stop sandbox container"
                );
            }
        }
    }

    async fn update_config(&mut self, config: Arc<ServerConfig>) {
        let previous = std::mem::replace(&mut self.config, config);
        self.status.enabled = self.config.enabled;
        self.status.quarantined = self.config.quarantined;

        match (previous.uses_oauth(), self.config.uses_oauth()) {
            (false, true) => self.status.oauth = Some(OAuthState::default()),
            (true, false) => self.status.oauth = None,
            _ => {}
        }

        if previous.transport_kind() != self.config.transport_kind() {
            debug!(
                server = %self.config.name,
                from = %previous.transport_kind(),
                to = %self.config.transport_kind(),
                "Transport kind changed"
            );
            self.transport = self.deps.transports.transport_for(self.config.transport_kind());
        }

        if !previous.is_structurally_different(&self.config) {
            debug!(server = %self.config.name, "Config hot-swapped");
            self.publish();
            return;
        }

        info!(server = %self.config.name, "Config changed, reconnecting");
        self.release().await;
        self.status.clear_tools();
        self.status.connection.retry_count = 0;
        if self.desired {
            self.connect().await;
        } else {
            self.transition(ConnectionStatus::Disconnected, None);
        }
    }
}
