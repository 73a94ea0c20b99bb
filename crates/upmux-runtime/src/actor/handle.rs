//! Handle to a running connection actor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use upmux_core::{ServerConfig, ServerStatus};

use super::command::{ActorCommand, StopOutcome};
use crate::error::SupervisorError;

/// Cheap to share; every method is safe to call from any task.
///
/// Completion is a `watch` channel, so `stop` and `wait_stopped` may be
/// awaited by any number of callers at once.
#[derive(Debug)]
pub struct ActorHandle {
    pub(super) name: String,
    pub(super) epoch: u64,
    pub(super) commands: mpsc::Sender<ActorCommand>,
    pub(super) status: watch::Receiver<ServerStatus>,
    pub(super) done: watch::Receiver<bool>,
    pub(super) cancel: CancellationToken,
    pub(super) abort: AbortHandle,
}

impl ActorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ownership epoch used for state view writes.
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    async fn send(&self, command: ActorCommand) -> Result<(), SupervisorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SupervisorError::ActorGone(self.name.clone()))
    }

    pub async fn connect(&self) -> Result<(), SupervisorError> {
        self.send(ActorCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), SupervisorError> {
        self.send(ActorCommand::Disconnect).await
    }

    pub async fn update_config(&self, config: Arc<ServerConfig>) -> Result<(), SupervisorError> {
        self.send(ActorCommand::UpdateConfig(config)).await
    }

    pub async fn login(&self) -> Result<(), SupervisorError> {
        self.send(ActorCommand::Login).await
    }

    pub async fn logout(&self) -> Result<(), SupervisorError> {
        self.send(ActorCommand::Logout).await
    }

    pub(crate) async fn auth_failed(&self, error: String) -> Result<(), SupervisorError> {
        self.send(ActorCommand::AuthFailed { error }).await
    }

    pub(crate) async fn token_refreshed(
        &self,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), SupervisorError> {
        self.send(ActorCommand::TokenRefreshed { expires_at }).await
    }

    /// Latest status published by the actor. Never waits on I/O.
    pub fn snapshot(&self) -> ServerStatus {
        self.status.borrow().clone()
    }

    /// Watch every status the actor publishes.
    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.status.clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolve once the actor task has exited, for whatever reason.
    pub async fn wait_stopped(&self) {
        let mut done = self.done.clone();
        // A dropped sender also means the task is gone.
        let _ = done.wait_for(|stopped| *stopped).await;
    }

    /// Request shutdown and wait at most `timeout` for teardown to finish.
    pub async fn stop(&self, timeout: Duration) -> StopOutcome {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, self.wait_stopped()).await {
            Ok(()) => StopOutcome::Stopped,
            Err(_) => StopOutcome::TimedOut,
        }
    }

    /// Kill the actor task outright. Used after a stop timed out.
    pub fn abort(&self) {
        self.abort.abort();
    }
}
