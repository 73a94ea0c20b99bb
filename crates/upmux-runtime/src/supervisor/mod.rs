//! Reconciliation engine for upstream connections.
//!
//! The supervisor compares each config snapshot with its actor pool and
//! dispatches one action per server. It never waits for those actions:
//! a slow sandbox start for one server cannot hold up config updates for
//! any other.
//!
//! Key design decisions:
//! - **Plan under a brief lock**: membership changes happen synchronously in
//!   [`Supervisor::reconcile`]; the I/O they imply runs in spawned tasks
//! - **Epoch ownership**: every actor (and every disabled placeholder) gets a
//!   fresh epoch, so a retiring actor can never overwrite its successor's
//!   state view entry
//! - **Bounded shutdown**: actors are stopped in parallel under one timeout,
//!   then sandbox containers are swept by label regardless of actor state

mod plan;
mod pool;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use upmux_core::{
    ConfigSnapshot, ConfigSource, ConnectionStatus, DockerIsolationDefaults, LabelSelector,
    Sandbox, ServerConfig, ServerStatus, TokenStore, TransportFactory, UpstreamEvent,
};

pub use plan::{ActionKind, CurrentServer, PlannedAction, ReconcilePlan, compute_plan};
use pool::{ActorPool, PoolState};

use crate::actor::{Actor, ActorDeps, ActorHandle, ActorSettings, StopOutcome};
use crate::error::SupervisorError;
use crate::events::EventBroadcaster;
use crate::oauth::{
    Authenticator, OAuthFlowCoordinator, RefreshExecutor, RefreshManager, RefreshNotice,
    StartReport,
};
use crate::stateview::StateView;

/// Upper bound on one dispatched action.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a removed or disabled actor gets to tear down.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a new actor waits for a same-named predecessor to retire.
pub const DEFAULT_PREDECESSOR_WAIT: Duration = Duration::from_secs(15);
/// Bound on the per-server label sweep after a stuck teardown.
const SERVER_SWEEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub action_timeout: Duration,
    pub stop_timeout: Duration,
    pub predecessor_wait: Duration,
    pub actor: ActorSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            predecessor_wait: DEFAULT_PREDECESSOR_WAIT,
            actor: ActorSettings::default(),
        }
    }
}

/// External collaborators the supervisor wires into every actor.
pub struct SupervisorDeps {
    pub transports: Arc<dyn TransportFactory>,
    pub tokens: Arc<dyn TokenStore>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Enables proactive token refresh when set.
    pub refresher: Option<Arc<dyn RefreshExecutor>>,
    pub flows: Arc<OAuthFlowCoordinator>,
}

impl SupervisorDeps {
    pub fn new(transports: Arc<dyn TransportFactory>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            transports,
            tokens,
            sandbox: None,
            authenticator: None,
            refresher: None,
            flows: Arc::new(OAuthFlowCoordinator::new()),
        }
    }

    #[must_use]
    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    #[must_use]
    pub fn with_refresher(mut self, refresher: Arc<dyn RefreshExecutor>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Share a flow coordinator with an interactive OAuth client.
    #[must_use]
    pub fn with_flows(mut self, flows: Arc<OAuthFlowCoordinator>) -> Self {
        self.flows = flows;
        self
    }
}

/// What happened during [`Supervisor::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Actors that finished teardown in time.
    pub stopped: usize,
    /// Servers whose actors had to be aborted.
    pub stuck: Vec<String>,
    /// Container ids force-stopped by the label sweep.
    pub swept: Vec<String>,
    pub sweep_error: Option<String>,
}

struct Inner {
    pool: ActorPool,
    actor_deps: ActorDeps,
    events: EventBroadcaster,
    settings: SupervisorSettings,
    cancel: CancellationToken,
    next_epoch: AtomicU64,
    refresh: Option<Arc<RefreshManager>>,
}

/// Owns the actor pool, the state view and the refresh manager.
///
/// Cloning is cheap and every clone drives the same pool.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Build a supervisor. Must be called inside a tokio runtime.
    pub fn new(deps: SupervisorDeps, settings: SupervisorSettings) -> Self {
        let SupervisorDeps {
            transports,
            tokens,
            sandbox,
            authenticator,
            refresher,
            flows,
        } = deps;

        let events = EventBroadcaster::new();
        let (refresh, notices) = match refresher {
            Some(executor) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let manager = RefreshManager::new(executor, Arc::clone(&tokens), flows, tx);
                (Some(manager), Some(rx))
            }
            None => (None, None),
        };

        let actor_deps = ActorDeps {
            transports,
            tokens,
            sandbox,
            isolation: Arc::new(ArcSwap::from_pointee(DockerIsolationDefaults::default())),
            state: Arc::new(StateView::new()),
            events: Arc::new(events.clone()),
            refresh: refresh.clone(),
            authenticator,
            settings: settings.actor,
        };

        let inner = Arc::new(Inner {
            pool: ActorPool::new(),
            actor_deps,
            events,
            settings,
            cancel: CancellationToken::new(),
            next_epoch: AtomicU64::new(1),
            refresh,
        });

        if let Some(notices) = notices {
            tokio::spawn(forward_refresh_notices(Arc::downgrade(&inner), notices));
        }

        Self { inner }
    }

    /// The lock-free status view external readers consume.
    pub fn state_view(&self) -> &Arc<StateView> {
        &self.inner.actor_deps.state
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.inner.events.subscribe()
    }

    pub fn refresh_manager(&self) -> Option<&Arc<RefreshManager>> {
        self.inner.refresh.as_ref()
    }

    /// Resume refresh schedules for stored tokens.
    pub async fn start_refresh(&self) -> Option<StartReport> {
        match &self.inner.refresh {
            Some(manager) => Some(manager.start().await),
            None => None,
        }
    }

    /// The live actor for `server`, for single-server drill-down.
    pub fn actor(&self, server: &str) -> Option<Arc<ActorHandle>> {
        self.inner.pool.get(server)
    }

    pub fn actor_count(&self) -> usize {
        self.inner.pool.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.pool.lock().shutting_down
    }

    /// Compute and dispatch the plan for `snapshot`.
    ///
    /// Returns as soon as the actions are spawned. Snapshots older than the
    /// last applied version are ignored; reapplying the same version is a
    /// no-op for every unchanged server.
    pub fn reconcile(&self, snapshot: &Arc<ConfigSnapshot>) -> Result<ReconcilePlan, SupervisorError> {
        self.inner.reconcile(snapshot)
    }

    /// Reconcile every snapshot `source` publishes until cancelled or shut down.
    pub async fn run(&self, source: Arc<dyn ConfigSource>) {
        let mut snapshots = source.subscribe();
        loop {
            let snapshot = Arc::clone(&snapshots.borrow_and_update());
            if let Err(e) = self.reconcile(&snapshot) {
                debug!(error = %e, "Stopping reconcile loop");
                break;
            }
            tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        debug!("Config source closed");
                        break;
                    }
                }
            }
        }
    }

    pub async fn login(&self, server: &str) -> Result<(), SupervisorError> {
        self.live_actor(server)?.login().await
    }

    pub async fn logout(&self, server: &str) -> Result<(), SupervisorError> {
        self.live_actor(server)?.logout().await
    }

    fn live_actor(&self, server: &str) -> Result<Arc<ActorHandle>, SupervisorError> {
        let pool = self.inner.pool.lock();
        if pool.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }
        pool.actors
            .get(server)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownServer(server.to_string()))
    }

    /// Stop every actor, wait at most `timeout`, then sweep sandbox
    /// containers by label and abort whatever is still running.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let inner = &self.inner;
        let handles = {
            let mut pool = inner.pool.lock();
            pool.shutting_down = true;
            pool.all_handles()
        };
        info!(
            actors = handles.len(),
            timeout_ms = timeout.as_millis(),
            "Shutting down supervisor"
        );

        if let Some(refresh) = &inner.refresh {
            refresh.stop();
        }
        inner.cancel.cancel();

        let outcomes = join_all(handles.iter().map(|h| h.stop(timeout))).await;

        let mut report = ShutdownReport::default();
        let mut stuck = Vec::new();
        for (handle, outcome) in handles.iter().zip(outcomes) {
            match outcome {
                StopOutcome::Stopped => report.stopped += 1,
                StopOutcome::TimedOut => {
                    warn!(
                        server = %handle.name(),
                        status = %handle.snapshot().status(),
                        "Actor did not stop within shutdown timeout"
                    );
                    report.stuck.push(handle.name().to_string());
                    stuck.push(handle);
                }
            }
        }

        if let Some(sandbox) = &inner.actor_deps.sandbox {
            let selector = LabelSelector::Instance(sandbox.instance_id().to_string());
            match sandbox.stop_by_label(&selector).await {
                Ok(ids) => {
                    if !ids.is_empty() {
                        info!(count = ids.len(), "Label sweep stopped leftover containers");
                    }
                    report.swept = ids;
                }
                Err(e) => {
                    warn!(error = %e, "Label sweep failed");
                    report.sweep_error = Some(e.to_string());
                }
            }
        }

        for handle in stuck {
            handle.abort();
            inner.publish_aborted(handle);
        }
        {
            let mut pool = inner.pool.lock();
            pool.actors.clear();
            pool.retiring.clear();
        }

        info!(
            stopped = report.stopped,
            stuck = report.stuck.len(),
            swept = report.swept.len(),
            "Supervisor shutdown complete"
        );
        report
    }
}

impl Inner {
    fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    fn reconcile(self: &Arc<Self>, snapshot: &Arc<ConfigSnapshot>) -> Result<ReconcilePlan, SupervisorError> {
        let version = snapshot.version();
        let plan = {
            let mut pool = self.pool.lock();
            if pool.shutting_down {
                return Err(SupervisorError::ShuttingDown);
            }
            if let Some(last) = pool.version
                && version < last
            {
                debug!(version, last, "Ignoring stale config snapshot");
                return Ok(ReconcilePlan::stale(version));
            }

            let plan = compute_plan(snapshot, &pool.current());
            pool.version = Some(version);
            self.actor_deps
                .isolation
                .store(Arc::clone(snapshot.docker_isolation()));

            for action in &plan.actions {
                self.apply(&mut pool, action, version);
            }
            plan
        };

        let counts = plan.counts();
        if counts.changed() > 0 {
            info!(
                version,
                connect = counts.connect,
                reconnect = counts.reconnect,
                disconnect = counts.disconnect,
                remove = counts.remove,
                unchanged = counts.unchanged,
                "Reconciliation dispatched"
            );
        } else {
            debug!(version, unchanged = counts.unchanged, "Reconciliation found nothing to do");
        }
        self.events
            .broadcast(UpstreamEvent::ReconciliationComplete { version, counts });
        Ok(plan)
    }

    /// Apply the membership side of one action and spawn its I/O.
    fn apply(self: &Arc<Self>, pool: &mut PoolState, action: &PlannedAction, version: u64) {
        let name = action.server.as_str();
        if action.kind != ActionKind::None {
            debug!(server = %name, action = %action.kind, version, "Dispatching action");
        }

        match (action.kind, &action.config) {
            (ActionKind::None, Some(config)) => {
                let changed = pool
                    .configs
                    .get(name)
                    .is_none_or(|current| current.differs_from(config));
                if pool.configs.insert(name.to_string(), Arc::clone(config)).is_none() {
                    self.events.broadcast(UpstreamEvent::server_added(name));
                }
                if changed && !pool.actors.contains_key(name) {
                    self.publish_placeholder(config);
                }
            }
            (ActionKind::Connect, Some(config)) => {
                if pool.configs.insert(name.to_string(), Arc::clone(config)).is_none() {
                    self.events.broadcast(UpstreamEvent::server_added(name));
                } else {
                    self.events.broadcast(UpstreamEvent::server_updated(name));
                }
                let predecessors = pool.predecessors(name);
                let actor = Actor::new(Arc::clone(config), self.next_epoch(), self.actor_deps.clone());
                let handle = Arc::new(actor.start(&self.cancel));
                pool.actors.insert(name.to_string(), Arc::clone(&handle));

                let wait = self.settings.predecessor_wait;
                self.spawn_action(name, ActionKind::Connect, version, async move {
                    if !predecessors.is_empty() {
                        let retired = join_all(predecessors.into_iter().map(|mut finished| async move {
                            // A dropped sender also means the predecessor is gone.
                            let _ = finished.wait_for(|done| *done).await;
                        }));
                        if tokio::time::timeout(wait, retired).await.is_err() {
                            warn!(server = %handle.name(), "Predecessor still tearing down, connecting anyway");
                        }
                    }
                    if let Err(e) = handle.connect().await {
                        debug!(server = %handle.name(), error = %e, "Connect not delivered");
                    }
                });
            }
            (ActionKind::Reconnect, Some(config)) => {
                pool.configs.insert(name.to_string(), Arc::clone(config));
                self.events.broadcast(UpstreamEvent::server_updated(name));
                if let Some(handle) = pool.actors.get(name).cloned() {
                    let config = Arc::clone(config);
                    self.spawn_action(name, ActionKind::Reconnect, version, async move {
                        if let Err(e) = handle.update_config(config).await {
                            debug!(server = %handle.name(), error = %e, "Config update not delivered");
                        }
                    });
                }
            }
            (ActionKind::Disconnect, Some(config)) => {
                pool.configs.insert(name.to_string(), Arc::clone(config));
                self.events.broadcast(UpstreamEvent::server_updated(name));
                self.retire(pool, name, version, ActionKind::Disconnect);
            }
            (ActionKind::Remove, _) => {
                pool.configs.remove(name);
                if !self.retire(pool, name, version, ActionKind::Remove) {
                    self.actor_deps.state.remove(name);
                }
                if let Some(refresh) = &self.refresh {
                    refresh.on_token_cleared(name);
                }
                self.events.broadcast(UpstreamEvent::server_removed(name));
            }
            (kind, None) => {
                error!(server = %name, action = %kind, "Planned action is missing its config");
            }
        }
    }

    /// Move the live actor for `server` to the retiring set and stop it in
    /// the background. Returns `false` if there was no live actor.
    fn retire(self: &Arc<Self>, pool: &mut PoolState, server: &str, version: u64, kind: ActionKind) -> bool {
        let Some((handle, finished)) = pool.retire(server) else {
            return false;
        };
        let retirement = Retirement {
            inner: Arc::clone(self),
            handle,
            finished,
            torn_down: false,
        };
        self.spawn_action(server, kind, version, async move {
            let mut retirement = retirement;
            let handle = Arc::clone(&retirement.handle);
            if handle.stop(retirement.inner.settings.stop_timeout).await == StopOutcome::TimedOut {
                warn!(server = %handle.name(), "Actor did not stop in time, aborting");
                handle.abort();
                retirement.inner.sweep_server(handle.name()).await;
            }
            retirement.torn_down = true;
        });
        true
    }

    /// Mark an aborted actor's entry stopped; its own teardown never ran.
    fn publish_aborted(&self, handle: &ActorHandle) {
        let mut status = handle.snapshot();
        let from = status.status();
        status.connection.status = ConnectionStatus::Stopped;
        status.connection.should_retry = false;
        status.clear_tools();
        status.updated_at = chrono::Utc::now();
        if self.actor_deps.state.publish_as(handle.epoch(), status) && from != ConnectionStatus::Stopped {
            self.events.broadcast(UpstreamEvent::state_changed(
                handle.name().to_string(),
                from,
                ConnectionStatus::Stopped,
                Some("aborted".to_string()),
            ));
        }
    }

    /// Post-teardown state cleanup for a retired actor.
    fn finalize(&self, handle: &ActorHandle) {
        let name = handle.name();
        let mut pool = self.pool.lock();
        pool.retiring.remove(&handle.epoch());
        if pool.actors.contains_key(name) {
            // A successor owns the entry now.
            return;
        }
        match pool.configs.get(name) {
            Some(config) => self.publish_placeholder(config),
            None => {
                self.actor_deps.state.remove_as(handle.epoch(), name);
            }
        }
        debug!(server = %name, epoch = handle.epoch(), "Actor retired");
    }

    /// Publish the status of a server that has no actor.
    fn publish_placeholder(&self, config: &ServerConfig) {
        let status = ServerStatus::new(&config.name, config.enabled, config.quarantined);
        self.actor_deps.state.publish_as(self.next_epoch(), status);
    }

    async fn sweep_server(&self, server: &str) {
        let Some(sandbox) = &self.actor_deps.sandbox else {
            return;
        };
        let selector = LabelSelector::Server {
            instance_id: sandbox.instance_id().to_string(),
            server: server.to_string(),
        };
        match tokio::time::timeout(SERVER_SWEEP_TIMEOUT, sandbox.stop_by_label(&selector)).await {
            Ok(Ok(ids)) if !ids.is_empty() => {
                info!(server = %server, count = ids.len(), "Swept containers of stuck actor");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(server = %server, error = %e, "Container sweep failed"),
            Err(_) => warn!(server = %server, "Container sweep timed out"),
        }
    }

    /// Run `action` in its own task under the action timeout.
    ///
    /// A monitor task reports timeouts and panics; neither affects any other
    /// action.
    fn spawn_action<F>(&self, server: &str, kind: ActionKind, version: u64, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timeout = self.settings.action_timeout;
        let task = tokio::spawn(async move { tokio::time::timeout(timeout, action).await.is_ok() });

        let events = self.events.clone();
        let server = server.to_string();
        tokio::spawn(async move {
            let error = match task.await {
                Ok(true) => return,
                Ok(false) => {
                    let error = format!("{kind} for '{server}' timed out after {}s", timeout.as_secs());
                    warn!(server = %server, action = %kind, "Action timed out");
                    error
                }
                Err(e) if e.is_panic() => {
                    error!(server = %server, action = %kind, "Action panicked");
                    format!("{kind} for '{server}' panicked")
                }
                Err(_) => return,
            };
            events.broadcast(UpstreamEvent::ReconciliationFailed { version, error });
        });
    }
}

/// A retiring actor's teardown. Dropping it, whether the teardown finished,
/// timed out or panicked, releases the pool slot and wakes successors.
struct Retirement {
    inner: Arc<Inner>,
    handle: Arc<ActorHandle>,
    finished: watch::Sender<bool>,
    torn_down: bool,
}

impl Drop for Retirement {
    fn drop(&mut self) {
        if !self.torn_down {
            let server = self.handle.name().to_string();
            warn!(server = %server, "Teardown interrupted, aborting actor");
            self.handle.abort();
            self.inner.publish_aborted(&self.handle);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let inner = Arc::clone(&self.inner);
                runtime.spawn(async move { inner.sweep_server(&server).await });
            }
        }
        self.inner.finalize(&self.handle);
        self.finished.send_replace(true);
    }
}

/// Deliver refresh outcomes to actors and the event stream.
async fn forward_refresh_notices(
    inner: Weak<Inner>,
    mut notices: mpsc::UnboundedReceiver<RefreshNotice>,
) {
    while let Some(notice) = notices.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match notice {
            RefreshNotice::Refreshed { server, expires_at } => {
                if let Some(handle) = inner.pool.get(&server)
                    && let Err(e) = handle.token_refreshed(expires_at).await
                {
                    debug!(server = %server, error = %e, "Refresh notice not delivered");
                }
                inner
                    .events
                    .broadcast(UpstreamEvent::TokenRefreshed { server, expires_at });
            }
            RefreshNotice::Failed {
                server,
                error,
                class,
                attempts,
            } => {
                if let Some(handle) = inner.pool.get(&server)
                    && let Err(e) = handle.auth_failed(error.clone()).await
                {
                    debug!(server = %server, error = %e, "Refresh failure not delivered");
                }
                inner.events.broadcast(UpstreamEvent::RefreshFailed {
                    server,
                    error,
                    class: class.as_str().to_string(),
                    attempts,
                });
            }
        }
    }
    debug!("Refresh notice forwarder stopped");
}
