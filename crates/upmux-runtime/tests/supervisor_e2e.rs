//! Supervisor reconciliation end to end, with mock transports.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    Behavior, MockFactory, MockSandbox, MockTransport, wait_for_state, wait_for_status,
};
use upmux_core::{
    AuthError, ConfigSnapshot, ConnectionStatus, DockerIsolationDefaults, OAuthSettings,
    OAuthStatus, OAuthToken, ProxyConfig, Sandbox, ServerConfig, TokenStore, UpdateKind,
    UpstreamEvent,
};
use upmux_runtime::{
    ActionKind, Authenticator, MemoryTokenStore, RefreshExecutor, RefreshState, Supervisor,
    SupervisorDeps, SupervisorSettings,
};

fn supervisor(transport: &Arc<MockTransport>, tokens: Arc<MemoryTokenStore>) -> Supervisor {
    let deps = SupervisorDeps::new(Arc::new(MockFactory(Arc::clone(transport))), tokens);
    Supervisor::new(deps, SupervisorSettings::default())
}

fn snapshot(version: u64, servers: Vec<ServerConfig>) -> Arc<ConfigSnapshot> {
    Arc::new(ConfigSnapshot::from_servers(version, servers))
}

fn disabled(mut config: ServerConfig) -> ServerConfig {
    config.enabled = false;
    config
}

fn oauth_server(name: &str) -> ServerConfig {
    let mut config = ServerConfig::remote(name, "https://secure.example/mcp");
    config.oauth = Some(OAuthSettings::default());
    config
}

#[tokio::test]
async fn test_connect_then_disable() {
    let transport = MockTransport::new();
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));
    let mut events = sup.subscribe();

    let plan = sup
        .reconcile(&snapshot(1, vec![ServerConfig::remote("svc-a", "http://x")]))
        .unwrap();
    assert_eq!(plan.action_for("svc-a"), Some(ActionKind::Connect));

    let status = wait_for_status(sup.state_view(), "svc-a", ConnectionStatus::Ready).await;
    assert_eq!(status.tool_count, 2);
    assert!(status.connection.connected_at.is_some());

    let connected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(UpstreamEvent::ServerConnected { server, tool_count }) = events.recv().await {
                return (server, tool_count);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(connected, ("svc-a".to_string(), 2));

    let plan = sup
        .reconcile(&snapshot(
            2,
            vec![disabled(ServerConfig::remote("svc-a", "http://x"))],
        ))
        .unwrap();
    assert_eq!(plan.action_for("svc-a"), Some(ActionKind::Disconnect));

    let status = wait_for_state(sup.state_view(), "svc-a", |s| {
        s.status() == ConnectionStatus::Disconnected && !s.enabled
    })
    .await;
    assert_eq!(status.tool_count, 0);
    assert!(status.tools.is_empty());
    assert!(sup.actor("svc-a").is_none());

    sup.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_reconcile_same_snapshot_is_noop() {
    let transport = MockTransport::new();
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));
    let snap = snapshot(
        1,
        vec![
            ServerConfig::remote("a", "http://a"),
            ServerConfig::remote("b", "http://b"),
            disabled(ServerConfig::remote("c", "http://c")),
        ],
    );

    let first = sup.reconcile(&snap).unwrap();
    assert_eq!(first.counts().connect, 2);
    wait_for_status(sup.state_view(), "a", ConnectionStatus::Ready).await;
    wait_for_status(sup.state_view(), "b", ConnectionStatus::Ready).await;
    let actor_a = sup.actor("a").unwrap();

    let second = sup.reconcile(&snap).unwrap();
    assert_eq!(second.changes().count(), 0);
    assert_eq!(second.counts().unchanged, 3);
    assert!(Arc::ptr_eq(&actor_a, &sup.actor("a").unwrap()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connects("a"), 1);
    assert_eq!(transport.connects("b"), 1);
    assert_eq!(transport.connects("c"), 0);

    let c = sup.state_view().server("c").unwrap();
    assert!(!c.enabled);
    assert_eq!(c.status(), ConnectionStatus::Disconnected);

    sup.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_stale_snapshot_ignored() {
    let transport = MockTransport::new();
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));

    sup.reconcile(&snapshot(5, vec![ServerConfig::remote("a", "http://a")]))
        .unwrap();
    let plan = sup.reconcile(&snapshot(4, Vec::new())).unwrap();
    assert!(plan.stale);
    assert!(plan.actions.is_empty());
    assert!(sup.actor("a").is_some());

    sup.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_changed_url_reconnects() {
    let transport = MockTransport::new();
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));

    sup.reconcile(&snapshot(1, vec![ServerConfig::remote("a", "http://old")]))
        .unwrap();
    wait_for_status(sup.state_view(), "a", ConnectionStatus::Ready).await;

    transport.set("a", Behavior::Tools(5));
    let plan = sup
        .reconcile(&snapshot(2, vec![ServerConfig::remote("a", "http://new")]))
        .unwrap();
    assert_eq!(plan.action_for("a"), Some(ActionKind::Reconnect));

    let status = wait_for_state(sup.state_view(), "a", |s| {
        s.status() == ConnectionStatus::Ready && s.tool_count == 5
    })
    .await;
    assert_eq!(status.connection.retry_count, 0);
    assert_eq!(transport.connects("a"), 2);

    sup.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_quarantine_toggle_is_hot_swapped() {
    let transport = MockTransport::new();
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));

    sup.reconcile(&snapshot(1, vec![ServerConfig::remote("a", "http://a")]))
        .unwrap();
    wait_for_status(sup.state_view(), "a", ConnectionStatus::Ready).await;

    let mut quarantined = ServerConfig::remote("a", "http://a");
    quarantined.quarantined = true;
    sup.reconcile(&snapshot(2, vec![quarantined])).unwrap();

    // Quarantined servers stay connected; only tool calls are refused upstream of us.
    let status = wait_for_state(sup.state_view(), "a", |s| s.quarantined).await;
    assert_eq!(status.status(), ConnectionStatus::Ready);
    assert_eq!(transport.connects("a"), 1);

    sup.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_removed_server_leaves_state_view() {
    let transport = MockTransport::new();
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));
    let mut events = sup.subscribe();

    sup.reconcile(&snapshot(
        1,
        vec![
            ServerConfig::remote("keep", "http://k"),
            ServerConfig::remote("drop", "http://d"),
        ],
    ))
    .unwrap();
    wait_for_status(sup.state_view(), "drop", ConnectionStatus::Ready).await;

    let plan = sup
        .reconcile(&snapshot(2, vec![ServerConfig::remote("keep", "http://k")]))
        .unwrap();
    assert_eq!(plan.action_for("drop"), Some(ActionKind::Remove));

    for _ in 0..1_000 {
        if sup.state_view().server("drop").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(sup.state_view().server("drop").is_none());
    assert!(sup.state_view().server("keep").is_some());

    let removed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(UpstreamEvent::ServerRemoved { server }) = events.recv().await {
                return server;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(removed, "drop");

    sup.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_panicking_actor_is_isolated() {
    let transport = MockTransport::new();
    transport.set("boom", Behavior::Panic);
    transport.set("ok", Behavior::Tools(3));
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));

    sup.reconcile(&snapshot(
        1,
        vec![
            ServerConfig::remote("boom", "http://boom"),
            ServerConfig::remote("ok", "http://ok"),
        ],
    ))
    .unwrap();

    let ok = wait_for_status(sup.state_view(), "ok", ConnectionStatus::Ready).await;
    assert_eq!(ok.tool_count, 3);

    let boom = wait_for_state(sup.state_view(), "boom", |s| {
        s.status() == ConnectionStatus::Error
            && s.connection.last_error.as_deref() == Some("actor panicked")
    })
    .await;
    assert!(!boom.connection.should_retry);

    let handle = sup.actor("boom").unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle.wait_stopped())
        .await
        .unwrap();

    sup.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_retries_with_backoff() {
    let transport = MockTransport::new();
    transport.set("flaky", Behavior::Fail("connection refused".into()));
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));

    sup.reconcile(&snapshot(1, vec![ServerConfig::remote("flaky", "http://f")]))
        .unwrap();

    let status = wait_for_status(sup.state_view(), "flaky", ConnectionStatus::Error).await;
    assert!(status.connection.should_retry);
    assert_eq!(status.connection.retry_count, 1);
    assert!(
        status
            .connection
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("connection refused"))
    );

    transport.set("flaky", Behavior::Tools(1));
    let status = wait_for_status(sup.state_view(), "flaky", ConnectionStatus::Ready).await;
    assert_eq!(status.connection.retry_count, 0);
    assert_eq!(transport.connects("flaky"), 2);

    sup.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_terminal_auth_failure_is_not_retried() {
    let transport = MockTransport::new();
    transport.set("secure", Behavior::Unauthorized);
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));

    sup.reconcile(&snapshot(1, vec![oauth_server("secure")]))
        .unwrap();

    let status = wait_for_status(sup.state_view(), "secure", ConnectionStatus::Error).await;
    assert!(!status.connection.should_retry);
    assert_eq!(status.oauth.as_ref().unwrap().status, OAuthStatus::Error);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.connects("secure"), 1);
    let status = sup.state_view().server("secure").unwrap();
    assert_eq!(status.status(), ConnectionStatus::Error);
    assert_eq!(status.oauth.as_ref().unwrap().status, OAuthStatus::Error);

    sup.shutdown(Duration::from_secs(1)).await;
}

#[derive(Default)]
struct FakeAuthenticator {
    calls: AtomicUsize,
}

#[async_trait]
impl Authenticator for FakeAuthenticator {
    async fn authenticate(
        &self,
        _server: &ServerConfig,
        _resource_metadata: Option<&str>,
    ) -> Result<OAuthToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(OAuthToken::bearer("fresh", Some(3600)).with_refresh_token("r"))
    }
}

#[tokio::test]
async fn test_logout_is_sticky_until_login() {
    let transport = MockTransport::new();
    let tokens = Arc::new(MemoryTokenStore::new());
    tokens
        .save_token("secure", &OAuthToken::bearer("stored", Some(3600)))
        .await
        .unwrap();

    let auth = Arc::new(FakeAuthenticator::default());
    let deps = SupervisorDeps::new(
        Arc::new(MockFactory(Arc::clone(&transport))),
        Arc::clone(&tokens) as Arc<dyn TokenStore>,
    )
    .with_authenticator(Arc::clone(&auth) as Arc<dyn Authenticator>);
    let sup = Supervisor::new(deps, SupervisorSettings::default());

    sup.reconcile(&snapshot(1, vec![oauth_server("secure")]))
        .unwrap();
    let status = wait_for_status(sup.state_view(), "secure", ConnectionStatus::Ready).await;
    assert_eq!(status.oauth.as_ref().unwrap().status, OAuthStatus::Authenticated);
    assert_eq!(auth.calls.load(Ordering::SeqCst), 0);

    sup.logout("secure").await.unwrap();
    let status = wait_for_state(sup.state_view(), "secure", |s| {
        s.status() == ConnectionStatus::Disconnected
            && s.oauth.as_ref().is_some_and(|o| o.user_logged_out)
    })
    .await;
    assert_eq!(status.tool_count, 0);
    assert!(tokens.get_token("secure").await.unwrap().is_none());

    sup.login("secure").await.unwrap();
    let status = wait_for_status(sup.state_view(), "secure", ConnectionStatus::Ready).await;
    let oauth = status.oauth.unwrap();
    assert!(!oauth.user_logged_out);
    assert!(oauth.has_refresh_token);
    assert_eq!(auth.calls.load(Ordering::SeqCst), 1);

    sup.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_reconcile_rejected_after_shutdown() {
    let transport = MockTransport::new();
    let sup = supervisor(&transport, Arc::new(MemoryTokenStore::new()));
    let report = sup.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.stopped, 0);
    assert!(sup.is_shutting_down());
    assert!(sup.reconcile(&snapshot(1, Vec::new())).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_isolated_server_without_image_is_not_retried() {
    let transport = MockTransport::new();
    let sandbox = MockSandbox::new("image-check");
    let deps = SupervisorDeps::new(
        Arc::new(MockFactory(Arc::clone(&transport))),
        Arc::new(MemoryTokenStore::new()),
    )
    .with_sandbox(Arc::clone(&sandbox) as Arc<dyn Sandbox>);
    let sup = Supervisor::new(deps, SupervisorSettings::default());

    let config = ProxyConfig {
        servers: vec![ServerConfig::stdio("bin", "my-binary", Vec::new())],
        docker_isolation: DockerIsolationDefaults {
            enabled: true,
            ..DockerIsolationDefaults::default()
        },
        data_dir: None,
    };
    sup.reconcile(&Arc::new(ConfigSnapshot::new(
        1,
        &config,
        UpdateKind::Init,
        "test",
    )))
    .unwrap();

    let status = wait_for_status(sup.state_view(), "bin", ConnectionStatus::Error).await;
    assert!(!status.connection.should_retry);
    assert!(
        status
            .connection
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("no image configured"))
    );

    tokio::time::sleep(Duration::from_secs(3600)).await;
    let status = sup.state_view().server("bin").unwrap();
    assert_eq!(status.status(), ConnectionStatus::Error);
    assert_eq!(status.connection.retry_count, 1);
    assert_eq!(transport.connects("bin"), 0);
    assert_eq!(sandbox.running(), 0);

    sup.shutdown(Duration::from_secs(1)).await;
}

#[derive(Default)]
struct RevokedGrant {
    calls: AtomicUsize,
}

#[async_trait]
impl RefreshExecutor for RevokedGrant {
    async fn refresh(&self, _server: &str) -> Result<OAuthToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AuthError::InvalidGrant("refresh token revoked".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_terminal_refresh_failure_drops_connection() {
    let transport = MockTransport::new();
    let tokens = Arc::new(MemoryTokenStore::new());
    tokens
        .save_token(
            "secure",
            &OAuthToken::bearer("short-lived", Some(60)).with_refresh_token("r"),
        )
        .await
        .unwrap();
    let executor = Arc::new(RevokedGrant::default());
    let deps = SupervisorDeps::new(
        Arc::new(MockFactory(Arc::clone(&transport))),
        Arc::clone(&tokens) as Arc<dyn TokenStore>,
    )
    .with_refresher(Arc::clone(&executor) as Arc<dyn RefreshExecutor>);
    let sup = Supervisor::new(deps, SupervisorSettings::default());
    let mut events = sup.subscribe();

    sup.reconcile(&snapshot(1, vec![oauth_server("secure")]))
        .unwrap();
    wait_for_status(sup.state_view(), "secure", ConnectionStatus::Ready).await;
    let report = sup.start_refresh().await.unwrap();
    assert_eq!(report.scheduled, 1);

    // 60s token: the proactive refresh fires at 45s and is rejected.
    tokio::time::sleep(Duration::from_secs(50)).await;
    let status = sup.state_view().server("secure").unwrap();
    assert_eq!(status.status(), ConnectionStatus::Error);
    assert!(!status.connection.should_retry);
    assert_eq!(status.tool_count, 0);
    let oauth = status.oauth.as_ref().unwrap();
    assert_eq!(oauth.status, OAuthStatus::Error);
    assert!(oauth.last_error.is_some());

    let mut refresh_failures = 0;
    while let Ok(event) = events.try_recv() {
        if let UpstreamEvent::RefreshFailed { server, class, .. } = event {
            assert_eq!(server, "secure");
            assert_eq!(class, "failed_invalid_grant");
            refresh_failures += 1;
        }
    }
    assert_eq!(refresh_failures, 1);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.connects("secure"), 1);
    assert_eq!(
        sup.state_view().server("secure").unwrap().status(),
        ConnectionStatus::Error
    );
    let refresh = sup.refresh_manager().unwrap().refresh_state("secure").unwrap();
    assert_eq!(refresh.state, RefreshState::Failed);

    sup.shutdown(Duration::from_secs(1)).await;
}
