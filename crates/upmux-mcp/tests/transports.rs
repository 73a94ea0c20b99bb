//! Transport integration tests against a fake stdio server and a mock HTTP server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use upmux_core::{
    OAuthSettings, OAuthToken, ServerConfig, TokenStore, TokenStoreError, Transport,
    TransportError, TransportKind,
};
use upmux_mcp::{HttpTransport, StdioTransport};
use wiremock::matchers::{body_partial_json, header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct MemoryTokens(Mutex<HashMap<String, OAuthToken>>);

#[async_trait]
impl TokenStore for MemoryTokens {
    async fn save_token(&self, server: &str, token: &OAuthToken) -> Result<(), TokenStoreError> {
        self.0.lock().unwrap().insert(server.to_string(), token.clone());
        Ok(())
    }

    async fn get_token(&self, server: &str) -> Result<Option<OAuthToken>, TokenStoreError> {
        Ok(self.0.lock().unwrap().get(server).cloned())
    }

    async fn delete_token(&self, server: &str) -> Result<(), TokenStoreError> {
        self.0.lock().unwrap().remove(server);
        Ok(())
    }

    async fn list_tokens(&self) -> Result<Vec<(String, OAuthToken)>, TokenStoreError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

fn init_result() -> serde_json::Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock"}
        }
    })
}

#[tokio::test]
async fn streamable_http_handshake_pagination_and_session_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Mcp-Session-Id", "sess-1")
                .set_body_json(init_result()),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .and(header("Mcp-Session-Id", "sess-1"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let page_two = json!({
        "jsonrpc": "2.0", "id": 3,
        "result": {"tools": [{"name": "c"}]}
    });
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list", "params": {"cursor": "p2"}})))
        .and(header("Mcp-Session-Id", "sess-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_two))
        .with_priority(1)
        .mount(&server)
        .await;

    let page_one = format!(
        "event: message\ndata: {}\n\n",
        json!({
            "jsonrpc": "2.0", "id": 2,
            "result": {"tools": [{"name": "a"}, {"name": "b"}], "nextCursor": "p2"}
        })
    );
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .and(header("Mcp-Session-Id", "sess-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(page_one, "text/event-stream"),
        )
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(header("Mcp-Session-Id", "sess-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(TransportKind::StreamableHttp).unwrap();
    let config = ServerConfig::remote("svc-a", format!("{}/mcp", server.uri()));

    let mut session = transport.connect(&config).await.unwrap();
    assert!(session.is_alive());

    let tools = session.list_tools().await.unwrap();
    let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    session.close().await;
    assert!(!session.is_alive());
}

#[tokio::test]
async fn unauthorized_carries_resource_metadata_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "WWW-Authenticate",
            r#"Bearer resource_metadata="https://auth.example/.well-known/oauth-protected-resource""#,
        ))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(TransportKind::Http).unwrap();
    let config = ServerConfig::remote("svc-a", server.uri());

    match transport.connect(&config).await {
        Err(TransportError::Unauthorized { resource_metadata }) => assert_eq!(
            resource_metadata.as_deref(),
            Some("https://auth.example/.well-known/oauth-protected-resource")
        ),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected unauthorized"),
    }
}

#[tokio::test]
async fn oauth_servers_send_stored_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer tok-123"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(init_result()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer tok-123"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let tokens = Arc::new(MemoryTokens::default());
    tokens
        .save_token("gh", &OAuthToken::bearer("tok-123", Some(3600)))
        .await
        .unwrap();

    let transport = HttpTransport::new(TransportKind::Http)
        .unwrap()
        .with_token_store(tokens);
    let mut config = ServerConfig::remote("gh", server.uri());
    config.oauth = Some(OAuthSettings::default());

    let mut session = transport.connect(&config).await.unwrap();
    session.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn stdio_transport_skips_noise_and_lists_tools() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("fake-mcp");
    std::fs::write(
        &script,
        r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"initialize"'*)
      echo "warming up..."
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"fake"}}}'
      ;;
    *'"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/message","params":{}}'
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo input"}]}}'
      ;;
  esac
done
"#,
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = ServerConfig::stdio("fake", script.to_str().unwrap(), vec![]);
    let mut session = StdioTransport::new().connect(&config).await.unwrap();

    let tools = session.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].description.as_deref(), Some("Echo input"));

    session.close().await;
    assert!(!session.is_alive());
}

#[tokio::test]
async fn stdio_transport_reports_missing_command() {
    let config = ServerConfig::stdio("ghost", "definitely-not-a-real-binary-xyz", vec![]);
    assert!(matches!(
        StdioTransport::new().connect(&config).await,
        Err(TransportError::Spawn(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn stdio_session_reports_exited_upstream() {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("short-lived-mcp");
    std::fs::write(
        &script,
        r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"fake"}}}'
      ;;
    *'"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo"}]}}'
      exit 0
      ;;
  esac
done
"#,
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = ServerConfig::stdio("short", script.to_str().unwrap(), vec![]);
    let mut session = StdioTransport::new().connect(&config).await.unwrap();
    assert_eq!(session.list_tools().await.unwrap().len(), 1);

    let mut alive = true;
    for _ in 0..100 {
        if !session.is_alive() {
            alive = false;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!alive, "exited upstream still reported alive");
    assert!(session.list_tools().await.is_err());

    session.close().await;
}
