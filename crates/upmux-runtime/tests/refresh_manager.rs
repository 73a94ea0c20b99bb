//! OAuth refresh scheduling, retry bounds and the refresh-token grant.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use upmux_core::{
    AuthError, AuthErrorClass, ConfigService, OAuthSettings, OAuthToken, ProxyConfig,
    ServerConfig, TokenStore,
};
use upmux_runtime::oauth::refresh::MIN_REFRESH_INTERVAL;
use upmux_runtime::{
    MemoryTokenStore, OAuthClient, OAuthFlowCoordinator, RefreshExecutor, RefreshManager,
    RefreshNotice, RefreshState, TokenRefresher,
};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Executor that fails every attempt with a fixed error.
struct FailingExecutor {
    calls: AtomicU32,
    error: fn() -> AuthError,
}

impl FailingExecutor {
    fn new(error: fn() -> AuthError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            error,
        })
    }
}

#[async_trait]
impl RefreshExecutor for FailingExecutor {
    async fn refresh(&self, _server: &str) -> Result<OAuthToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

struct SucceedingExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl RefreshExecutor for SucceedingExecutor {
    async fn refresh(&self, _server: &str) -> Result<OAuthToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(OAuthToken::bearer("new", Some(3600)).with_refresh_token("r"))
    }
}

fn manager(
    executor: Arc<dyn RefreshExecutor>,
    tokens: Arc<dyn TokenStore>,
) -> (Arc<RefreshManager>, mpsc::UnboundedReceiver<RefreshNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let manager = RefreshManager::new(executor, tokens, Arc::new(OAuthFlowCoordinator::new()), tx);
    (manager, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<RefreshNotice>) -> Vec<RefreshNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        out.push(notice);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_max_retries_emits_one_failure() {
    let executor = FailingExecutor::new(|| AuthError::Network("connection refused".into()));
    let (manager, mut rx) = manager(executor.clone(), Arc::new(MemoryTokenStore::new()));

    manager.on_token_saved("svc", Some(Utc::now() + chrono::Duration::hours(1)));
    assert_eq!(
        manager.refresh_state("svc").unwrap().state,
        RefreshState::Scheduled
    );

    // 45 min to the first attempt, then 49 backoffs capped at 5 min.
    tokio::time::sleep(Duration::from_secs(6 * 3600)).await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 50);
    let notices = drain(&mut rx);
    assert_eq!(notices.len(), 1, "{notices:?}");
    match &notices[0] {
        RefreshNotice::Failed {
            server,
            class,
            attempts,
            ..
        } => {
            assert_eq!(server, "svc");
            assert_eq!(*class, AuthErrorClass::Network);
            assert_eq!(*attempts, 50);
        }
        other => panic!("unexpected notice {other:?}"),
    }
    assert_eq!(
        manager.refresh_state("svc").unwrap().state,
        RefreshState::Failed
    );

    // Nothing more fires once failed.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 50);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_grant_stops_immediately() {
    let executor = FailingExecutor::new(|| AuthError::InvalidGrant("refresh token revoked".into()));
    let (manager, mut rx) = manager(executor.clone(), Arc::new(MemoryTokenStore::new()));

    manager.on_token_saved("svc", Some(Utc::now() + chrono::Duration::minutes(10)));
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    let notices = drain(&mut rx);
    assert_eq!(notices.len(), 1);
    assert!(matches!(
        &notices[0],
        RefreshNotice::Failed {
            class: AuthErrorClass::InvalidGrant,
            attempts: 1,
            ..
        }
    ));
    let info = manager.refresh_state("svc").unwrap();
    assert_eq!(info.state, RefreshState::Failed);
    assert!(info.last_error.unwrap().contains("re-authentication required"));
}

#[tokio::test(start_paused = true)]
async fn test_server_gone_is_terminal() {
    let executor = FailingExecutor::new(|| AuthError::ServerNotFound("svc".into()));
    let (manager, mut rx) = manager(executor.clone(), Arc::new(MemoryTokenStore::new()));

    manager.on_token_saved("svc", Some(Utc::now() + chrono::Duration::minutes(10)));
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [RefreshNotice::Failed {
            class: AuthErrorClass::ServerGone,
            ..
        }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_never_fires_immediately() {
    let executor = FailingExecutor::new(|| AuthError::Network("reset".into()));
    let (manager, _rx) = manager(executor.clone(), Arc::new(MemoryTokenStore::new()));
    manager.on_token_saved("svc", Some(Utc::now() + chrono::Duration::hours(1)));

    let zero = manager
        .reschedule_after_delay("svc", chrono::Duration::zero())
        .unwrap();
    assert!(zero >= MIN_REFRESH_INTERVAL);

    let negative = manager
        .reschedule_after_delay("svc", chrono::Duration::seconds(-1))
        .unwrap();
    assert!(negative >= MIN_REFRESH_INTERVAL);

    tokio::time::sleep(MIN_REFRESH_INTERVAL - Duration::from_millis(100)).await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    assert!(
        manager
            .reschedule_after_delay("unknown", chrono::Duration::zero())
            .is_none()
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_classifies_stored_tokens() {
    let tokens = Arc::new(MemoryTokenStore::new());
    tokens
        .save_token("fresh", &OAuthToken::bearer("a", Some(3600)))
        .await
        .unwrap();
    tokens
        .save_token(
            "expired-refreshable",
            &OAuthToken::bearer("b", Some(-60)).with_refresh_token("r"),
        )
        .await
        .unwrap();
    tokens
        .save_token("expired-dead", &OAuthToken::bearer("c", Some(-60)))
        .await
        .unwrap();

    let executor = Arc::new(SucceedingExecutor {
        calls: AtomicU32::new(0),
    });
    let (manager, mut rx) = manager(executor.clone(), tokens);

    let report = manager.start().await;
    assert_eq!(
        (report.scheduled, report.immediate, report.expired),
        (1, 1, 1)
    );
    assert_eq!(
        manager.refresh_state("expired-dead").unwrap().state,
        RefreshState::Failed
    );

    let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        notice,
        RefreshNotice::Refreshed { ref server, .. } if server == "expired-refreshable"
    ));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.refresh_state("expired-refreshable").unwrap().state,
        RefreshState::Scheduled
    );

    manager.stop();
    assert_eq!(manager.schedule_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_token_cleared_cancels_schedule() {
    let executor = FailingExecutor::new(|| AuthError::Network("reset".into()));
    let (manager, _rx) = manager(executor.clone(), Arc::new(MemoryTokenStore::new()));

    manager.on_token_saved("svc", Some(Utc::now() + chrono::Duration::minutes(10)));
    manager.on_token_cleared("svc");
    assert!(manager.refresh_state("svc").is_none());

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

fn oauth_config(server_url: &str) -> ProxyConfig {
    let mut server = ServerConfig::remote("svc", format!("{server_url}/mcp"));
    server.oauth = Some(OAuthSettings {
        client_id: Some("client-1".into()),
        ..OAuthSettings::default()
    });
    ProxyConfig {
        servers: vec![server],
        ..ProxyConfig::default()
    }
}

async fn refresher_for(
    mock: &MockServer,
    tokens: &Arc<MemoryTokenStore>,
) -> TokenRefresher {
    let config = Arc::new(ConfigService::new(oauth_config(&mock.uri())).unwrap());
    let store: Arc<dyn TokenStore> = Arc::clone(tokens) as Arc<dyn TokenStore>;
    let client = OAuthClient::new(Arc::clone(&store), Arc::new(OAuthFlowCoordinator::new())).unwrap();

    let mut stored = OAuthToken::bearer("old", Some(-10)).with_refresh_token("refresh-1");
    stored.token_endpoint = Some(format!("{}/token", mock.uri()));
    stored.client_id = Some("client-1".into());
    store.save_token("svc", &stored).await.unwrap();

    TokenRefresher::new(Arc::new(client), store, config)
}

#[tokio::test]
async fn test_refresh_grant_persists_new_token() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&mock)
        .await;

    let tokens = Arc::new(MemoryTokenStore::new());
    let refresher = refresher_for(&mock, &tokens).await;

    let token = refresher.refresh("svc").await.unwrap();
    assert_eq!(token.access_token, "new-access");
    // Non-rotating servers keep the old refresh token.
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
    assert!(!token.is_expired());

    let stored = tokens.get_token("svc").await.unwrap().unwrap();
    assert_eq!(stored.access_token, "new-access");
    assert_eq!(stored.client_id.as_deref(), Some("client-1"));
}

#[tokio::test]
async fn test_refresh_grant_invalid_grant_is_terminal() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "refresh token revoked"
        })))
        .mount(&mock)
        .await;

    let tokens = Arc::new(MemoryTokenStore::new());
    let refresher = refresher_for(&mock, &tokens).await;

    let err = refresher.refresh("svc").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant(_)));
    assert!(err.is_terminal());

    let stored = tokens.get_token("svc").await.unwrap().unwrap();
    assert_eq!(stored.access_token, "old");
}

#[tokio::test]
async fn test_refresh_for_unknown_server_is_server_gone() {
    let mock = MockServer::start().await;
    let tokens = Arc::new(MemoryTokenStore::new());
    let refresher = refresher_for(&mock, &tokens).await;

    let err = refresher.refresh("missing").await.unwrap_err();
    assert_eq!(err.classify(), AuthErrorClass::ServerGone);
}
