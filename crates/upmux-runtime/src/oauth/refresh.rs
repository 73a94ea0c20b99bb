//! Proactive OAuth token refresh.
//!
//! Each server with a stored token has at most one schedule. A schedule
//! fires a single timer task; rescheduling aborts the old task and bumps a
//! generation counter so a timer that already woke up cannot act twice.
//!
//! Refresh time is the earlier of 75% of the token lifetime and five
//! minutes before expiry, never sooner than five seconds from now and never
//! later than five seconds before expiry.
//!
//! Failures back off from 10s to 5 minutes. Invalid grants and vanished
//! servers stop immediately; so do 50 consecutive failures and tokens that
//! expired more than a day ago. Each of those terminal transitions sends
//! exactly one [`RefreshNotice::Failed`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use upmux_core::{AuthError, AuthErrorClass, BackoffPolicy, OAuthToken, TokenStore};

use super::coordinator::OAuthFlowCoordinator;

/// Fraction of the token lifetime after which a refresh is attempted.
pub const REFRESH_THRESHOLD: f64 = 0.75;
/// Consecutive failures before giving up.
pub const MAX_REFRESH_RETRIES: u32 = 50;
/// Floor for any scheduled delay.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
/// Preferred headroom before expiry.
pub const MIN_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);
/// Minimum spacing between two attempts for one server.
pub const REFRESH_RATE_LIMIT: Duration = Duration::from_secs(10);
/// Retry delay while an interactive flow holds the server.
pub const FLOW_ACTIVE_RETRY: Duration = Duration::from_secs(10);
/// An expired token is retried for at most this long past its expiry.
pub const MAX_EXPIRED_TOKEN_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Refresh state of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Scheduled,
    Retrying,
    Failed,
}

/// Read-only view of a schedule, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshStateInfo {
    pub state: RefreshState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_attempt: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome notifications delivered to the owner of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshNotice {
    Refreshed {
        server: String,
        expires_at: Option<DateTime<Utc>>,
    },
    Failed {
        server: String,
        error: String,
        class: AuthErrorClass,
        attempts: u32,
    },
}

/// Performs one refresh-token grant and persists the result.
#[async_trait]
pub trait RefreshExecutor: Send + Sync {
    async fn refresh(&self, server: &str) -> Result<OAuthToken, AuthError>;
}

/// Counts from [`RefreshManager::start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartReport {
    pub scheduled: usize,
    pub immediate: usize,
    pub expired: usize,
}

/// Delay until the next proactive refresh for a token with `lifetime` left.
///
/// `None` when the token is too close to expiry for a proactive refresh.
pub fn compute_refresh_delay(lifetime: Duration) -> Option<Duration> {
    if lifetime.is_zero() {
        return None;
    }
    let proportional = lifetime.mul_f64(REFRESH_THRESHOLD);
    let delay = match lifetime.checked_sub(MIN_REFRESH_BUFFER) {
        Some(buffered) if !buffered.is_zero() && buffered < proportional => buffered,
        _ => proportional,
    };
    let delay = delay.max(MIN_REFRESH_INTERVAL);

    let latest = lifetime.checked_sub(MIN_REFRESH_INTERVAL)?;
    if latest.is_zero() {
        return None;
    }
    Some(delay.min(latest))
}

#[derive(Debug)]
struct Schedule {
    expires_at: Option<DateTime<Utc>>,
    state: RefreshState,
    retry_count: u32,
    last_error: Option<String>,
    last_attempt: Option<Instant>,
    generation: u64,
    timer: Option<AbortHandle>,
    next_attempt: Option<DateTime<Utc>>,
}

impl Schedule {
    fn new(expires_at: Option<DateTime<Utc>>, state: RefreshState) -> Self {
        Self {
            expires_at,
            state,
            retry_count: 0,
            last_error: None,
            last_attempt: None,
            generation: 0,
            timer: None,
            next_attempt: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.next_attempt = None;
    }

    fn info(&self) -> RefreshStateInfo {
        RefreshStateInfo {
            state: self.state,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            next_attempt: self.next_attempt,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Default)]
struct Schedules {
    by_server: HashMap<String, Schedule>,
    next_generation: u64,
    stopped: bool,
}

/// Owns every refresh schedule.
pub struct RefreshManager {
    me: Weak<Self>,
    schedules: Mutex<Schedules>,
    executor: Arc<dyn RefreshExecutor>,
    tokens: Arc<dyn TokenStore>,
    flows: Arc<OAuthFlowCoordinator>,
    notices: mpsc::UnboundedSender<RefreshNotice>,
    policy: BackoffPolicy,
    max_retries: u32,
}

impl RefreshManager {
    pub fn new(
        executor: Arc<dyn RefreshExecutor>,
        tokens: Arc<dyn TokenStore>,
        flows: Arc<OAuthFlowCoordinator>,
        notices: mpsc::UnboundedSender<RefreshNotice>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            schedules: Mutex::new(Schedules::default()),
            executor,
            tokens,
            flows,
            notices,
            policy: BackoffPolicy::OAUTH_REFRESH,
            max_retries: MAX_REFRESH_RETRIES,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Schedules> {
        // Schedules stay consistent even if a holder panicked mid-update.
        self.schedules
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Load stored tokens and resume their schedules.
    ///
    /// Unexpired tokens are scheduled; expired ones with a refresh token are
    /// refreshed right away in the background; the rest are marked failed.
    pub async fn start(&self) -> StartReport {
        let tokens = match self.tokens.list_tokens().await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "Failed to load stored OAuth tokens");
                return StartReport::default();
            }
        };

        let now = Utc::now();
        let mut report = StartReport::default();
        let mut immediate = Vec::new();
        {
            let mut schedules = self.lock();
            schedules.stopped = false;
            for (server, token) in tokens {
                let Some(expires_at) = token.expires_at else {
                    continue;
                };
                if expires_at > now {
                    self.schedule_locked(&mut schedules, &server, expires_at);
                    report.scheduled += 1;
                } else if token.has_refresh_token() {
                    info!(server = %server, expired_at = %expires_at, "OAuth token refresh needed at startup");
                    schedules.by_server.insert(
                        server.clone(),
                        Schedule::new(Some(expires_at), RefreshState::Retrying),
                    );
                    immediate.push(server);
                    report.immediate += 1;
                } else {
                    warn!(server = %server, expired_at = %expires_at, "OAuth token expired with no refresh token, login required");
                    let mut schedule = Schedule::new(Some(expires_at), RefreshState::Failed);
                    schedule.last_error =
                        Some("token expired and no refresh token available".to_string());
                    schedules.by_server.insert(server, schedule);
                    report.expired += 1;
                }
            }
        }

        if let (false, Some(me)) = (immediate.is_empty(), self.me.upgrade()) {
            tokio::spawn(async move {
                for server in immediate {
                    me.attempt(&server, None).await;
                }
            });
        }

        info!(
            scheduled = report.scheduled,
            immediate = report.immediate,
            expired = report.expired,
            "Refresh manager started"
        );
        report
    }

    /// Cancel every schedule. Later calls to `on_token_saved` are ignored.
    pub fn stop(&self) {
        let mut schedules = self.lock();
        schedules.stopped = true;
        let count = schedules.by_server.len();
        for schedule in schedules.by_server.values_mut() {
            schedule.cancel_timer();
        }
        schedules.by_server.clear();
        info!(cancelled = count, "Refresh manager stopped");
    }

    /// A token was stored for `server`; (re)schedule its refresh.
    pub fn on_token_saved(&self, server: &str, expires_at: Option<DateTime<Utc>>) {
        let mut schedules = self.lock();
        if schedules.stopped {
            return;
        }
        if let Some(existing) = schedules.by_server.get_mut(server) {
            existing.cancel_timer();
        }
        match expires_at {
            Some(expires_at) => self.schedule_locked(&mut schedules, server, expires_at),
            None => {
                schedules.by_server.remove(server);
            }
        }
    }

    /// The token for `server` is gone (logout, server removed).
    pub fn on_token_cleared(&self, server: &str) {
        let mut schedules = self.lock();
        if let Some(mut schedule) = schedules.by_server.remove(server) {
            schedule.cancel_timer();
            info!(server = %server, "Cancelled refresh schedule, token cleared");
        }
    }

    pub fn refresh_state(&self, server: &str) -> Option<RefreshStateInfo> {
        self.lock().by_server.get(server).map(Schedule::info)
    }

    pub fn schedule_count(&self) -> usize {
        self.lock().by_server.len()
    }

    /// Re-arm `server`'s timer after `delay`, floored at the minimum interval.
    ///
    /// Returns the effective delay, or `None` if the server has no schedule.
    pub fn reschedule_after_delay(&self, server: &str, delay: chrono::Duration) -> Option<Duration> {
        let delay = delay.to_std().unwrap_or(Duration::ZERO);
        let mut schedules = self.lock();
        self.arm_locked(&mut schedules, server, delay)
    }

    /// Refresh `server` immediately, outside the timer.
    ///
    /// Used when a connect finds an expired access token. On success the
    /// next proactive refresh is scheduled.
    pub async fn refresh_now(&self, server: &str) -> Result<OAuthToken, AuthError> {
        let token = self.executor.refresh(server).await?;
        {
            let mut schedules = self.lock();
            if !schedules.stopped {
                let schedule = schedules
                    .by_server
                    .entry(server.to_string())
                    .or_insert_with(|| Schedule::new(token.expires_at, RefreshState::Idle));
                schedule.last_attempt = Some(Instant::now());
                schedule.retry_count = 0;
                schedule.last_error = None;
                schedule.state = RefreshState::Idle;
                if let Some(expires_at) = token.expires_at {
                    self.schedule_locked(&mut schedules, server, expires_at);
                }
            }
        }
        Ok(token)
    }

    fn schedule_locked(&self, schedules: &mut Schedules, server: &str, expires_at: DateTime<Utc>) {
        let lifetime = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let Some(delay) = compute_refresh_delay(lifetime) else {
            debug!(server = %server, expires_at = %expires_at, "Token too close to expiry for proactive refresh");
            return;
        };

        let schedule = schedules
            .by_server
            .entry(server.to_string())
            .or_insert_with(|| Schedule::new(Some(expires_at), RefreshState::Scheduled));
        schedule.cancel_timer();
        schedule.expires_at = Some(expires_at);
        schedule.state = RefreshState::Scheduled;
        schedule.retry_count = 0;
        schedule.last_error = None;

        self.arm_locked(schedules, server, delay);
        info!(
            server = %server,
            expires_at = %expires_at,
            delay_secs = delay.as_secs(),
            "OAuth token refresh scheduled"
        );
    }

    fn arm_locked(&self, schedules: &mut Schedules, server: &str, delay: Duration) -> Option<Duration> {
        if schedules.stopped {
            return None;
        }
        let delay = delay.max(MIN_REFRESH_INTERVAL);
        schedules.next_generation += 1;
        let generation = schedules.next_generation;
        let schedule = schedules.by_server.get_mut(server)?;
        schedule.cancel_timer();
        schedule.generation = generation;
        schedule.next_attempt = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);

        let me = self.me.clone();
        let name = server.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = me.upgrade() {
                manager.attempt(&name, Some(generation)).await;
            }
        });
        schedule.timer = Some(task.abort_handle());
        Some(delay)
    }

    /// One refresh attempt. `generation` is `Some` when fired by a timer.
    async fn attempt(&self, server: &str, generation: Option<u64>) {
        {
            let mut schedules = self.lock();
            if schedules.stopped {
                return;
            }
            let Some(schedule) = schedules.by_server.get_mut(server) else {
                return;
            };
            if let Some(generation) = generation {
                if schedule.generation != generation {
                    return;
                }
                schedule.timer = None;
                schedule.next_attempt = None;
            }

            if self.flows.is_active(server) {
                info!(server = %server, "Skipping refresh, OAuth flow in progress");
                self.arm_locked(&mut schedules, server, FLOW_ACTIVE_RETRY);
                return;
            }

            let elapsed = schedule.last_attempt.map(|at| at.elapsed());
            if let Some(elapsed) = elapsed.filter(|e| *e < REFRESH_RATE_LIMIT) {
                let wait = REFRESH_RATE_LIMIT - elapsed;
                debug!(server = %server, wait_ms = wait.as_millis(), "Refresh rate limited");
                self.arm_locked(&mut schedules, server, wait);
                return;
            }
            schedule.last_attempt = Some(Instant::now());
        }

        info!(server = %server, "Executing OAuth token refresh");
        match self.executor.refresh(server).await {
            Ok(token) => self.handle_success(server, &token),
            Err(e) => self.handle_failure(server, &e),
        }
    }

    fn handle_success(&self, server: &str, token: &OAuthToken) {
        {
            let mut schedules = self.lock();
            let Some(schedule) = schedules.by_server.get_mut(server) else {
                // Cleared while the grant was in flight.
                return;
            };
            schedule.retry_count = 0;
            schedule.last_error = None;
            schedule.state = RefreshState::Idle;
            schedule.expires_at = token.expires_at;
            if let Some(expires_at) = token.expires_at {
                self.schedule_locked(&mut schedules, server, expires_at);
            }
        }
        info!(server = %server, expires_at = ?token.expires_at, "OAuth token refresh succeeded");
        let _ = self.notices.send(RefreshNotice::Refreshed {
            server: server.to_string(),
            expires_at: token.expires_at,
        });
    }

    fn handle_failure(&self, server: &str, err: &AuthError) {
        let class = err.classify();
        let message = err.to_string();

        let mut schedules = self.lock();
        let Some(schedule) = schedules.by_server.get_mut(server) else {
            return;
        };
        schedule.retry_count = schedule.retry_count.saturating_add(1);
        schedule.last_error = Some(message.clone());
        schedule.state = RefreshState::Retrying;
        let retry_count = schedule.retry_count;

        warn!(
            server = %server,
            error = %message,
            error_type = class.as_str(),
            retry_count,
            "OAuth token refresh failed"
        );

        let expired_for = schedule
            .expires_at
            .and_then(|at| (Utc::now() - at).to_std().ok());

        let terminal = if class.is_terminal() {
            Some(match class {
                AuthErrorClass::InvalidGrant => {
                    "refresh token expired or revoked, re-authentication required".to_string()
                }
                _ => message.clone(),
            })
        } else if retry_count >= self.max_retries {
            Some("max retries exceeded, re-authentication required".to_string())
        } else if expired_for.is_some_and(|age| age > MAX_EXPIRED_TOKEN_AGE) {
            Some("token expired too long ago, re-authentication required".to_string())
        } else {
            None
        };

        if let Some(reason) = terminal {
            schedule.state = RefreshState::Failed;
            schedule.last_error = Some(reason.clone());
            schedule.cancel_timer();
            drop(schedules);

            error!(server = %server, reason = %reason, attempts = retry_count, "OAuth token refresh stopped");
            let _ = self.notices.send(RefreshNotice::Failed {
                server: server.to_string(),
                error: message,
                class,
                attempts: retry_count,
            });
            return;
        }

        let backoff = self.policy.delay_for(retry_count - 1);
        self.arm_locked(&mut schedules, server, backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_lived_token_uses_threshold() {
        // 1h token: 45 min (threshold) beats 55 min (buffer).
        assert_eq!(
            compute_refresh_delay(Duration::from_secs(3600)),
            Some(Duration::from_secs(2700))
        );
    }

    #[test]
    fn test_short_lived_token_keeps_buffer() {
        // 10 min token: buffer gives 5 min, threshold 7.5 min.
        assert_eq!(
            compute_refresh_delay(Duration::from_secs(600)),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_tiny_lifetimes() {
        // 6s left: floored to 5s but clamped to 1s before expiry.
        assert_eq!(
            compute_refresh_delay(Duration::from_secs(6)),
            Some(Duration::from_secs(1))
        );
        assert_eq!(compute_refresh_delay(Duration::from_secs(5)), None);
        assert_eq!(compute_refresh_delay(Duration::ZERO), None);
    }

    #[test]
    fn test_delay_never_below_floor_when_room() {
        for secs in [11, 20, 60, 301, 86_400] {
            let delay = compute_refresh_delay(Duration::from_secs(secs)).unwrap();
            assert!(delay >= MIN_REFRESH_INTERVAL, "{secs}s -> {delay:?}");
            assert!(delay <= Duration::from_secs(secs) - MIN_REFRESH_INTERVAL);
        }
    }

    mod mocked {
        use super::*;
        use mockall::mock;
        use upmux_core::TokenStoreError;

        mock! {
            Store {}
            #[async_trait]
            impl TokenStore for Store {
                async fn save_token(&self, server: &str, token: &OAuthToken) -> Result<(), TokenStoreError>;
                async fn get_token(&self, server: &str) -> Result<Option<OAuthToken>, TokenStoreError>;
                async fn delete_token(&self, server: &str) -> Result<(), TokenStoreError>;
                async fn list_tokens(&self) -> Result<Vec<(String, OAuthToken)>, TokenStoreError>;
            }
        }

        mock! {
            Executor {}
            #[async_trait]
            impl RefreshExecutor for Executor {
                async fn refresh(&self, server: &str) -> Result<OAuthToken, AuthError>;
            }
        }

        #[test]
        fn test_start_with_unreadable_store_schedules_nothing() {
            let mut store = MockStore::new();
            store
                .expect_list_tokens()
                .times(1)
                .returning(|| Err(TokenStoreError::Io("permission denied".to_string())));
            let mut executor = MockExecutor::new();
            executor.expect_refresh().never();

            let (tx, mut rx) = mpsc::unbounded_channel();
            let manager = RefreshManager::new(
                Arc::new(executor),
                Arc::new(store),
                Arc::new(OAuthFlowCoordinator::new()),
                tx,
            );

            let report = tokio_test::block_on(manager.start());
            assert_eq!(report, StartReport::default());
            assert_eq!(manager.schedule_count(), 0);
            assert!(rx.try_recv().is_err());
        }
    }
}
