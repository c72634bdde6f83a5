//! End-to-end tests for the HTTP front door.
//!
//! The backend is a `cat` child process: every forwarded JSON-RPC line is
//! echoed back and parses as a non-error response, which is enough to
//! exercise metering, headers, sessions, and auth without a real MCP server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};

use paygate::config::{BackendSpec, GatewayConfig, PricingConfig};
use paygate::services::audit::AuditLogger;
use paygate::services::gate::{Gate, GateSettings};
use paygate::services::hooks::{NoopGroupManager, NoopPluginManager, NoopTeamChecker};
use paygate::services::key_store::{CreateKeyOptions, KeyStore};
use paygate::services::oauth::OAuthProvider;
use paygate::services::proxy::Proxy;
use paygate::services::quota::QuotaTracker;
use paygate::services::rate_limiter::RateLimiter;
use paygate::services::scoped_token::ScopedTokenManager;
use paygate::services::session::SessionManager;
use paygate::services::usage::UsageMeter;
use paygate::services::webhook::WebhookEmitter;
use paygate::{create_app, AppState};

struct Harness {
    server: TestServer,
    state: AppState,
}

fn name(value: &'static str) -> HeaderName {
    HeaderName::from_static(value)
}

fn value(text: &str) -> HeaderValue {
    HeaderValue::from_str(text).unwrap()
}

fn test_config(temp: &tempfile::TempDir) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        backend: Some(BackendSpec::Stdio {
            command: "cat".into(),
            args: vec![],
        }),
        backends: vec![],
        forward_timeout: Duration::from_secs(2),
        pricing: PricingConfig {
            default_price: 3,
            per_kb_price: 0,
            tool_prices: Default::default(),
        },
        global_rate_limit: 0,
        tool_rate_limits: Default::default(),
        free_methods: vec![],
        refund_on_failure: true,
        shadow_mode: false,
        global_quota: None,
        session_timeout: Duration::from_secs(60),
        max_sessions: 100,
        max_sse_per_session: 4,
        snapshot_path: temp.path().join("keys.json"),
        snapshot_flush_interval: Duration::from_secs(60),
        redis_url: None,
        token_secret: "integration-test-secret-value".into(),
        trusted_proxies: vec![],
        cors_origins: vec![],
        max_body_bytes: 1024 * 1024,
        custom_headers: vec![("X-Gateway".into(), "paygate-test".into())],
        webhook_url: None,
        drain_deadline: Duration::from_secs(1),
    }
}

async fn harness(temp: &tempfile::TempDir) -> Harness {
    let config = test_config(temp);

    let key_store = Arc::new(KeyStore::new(config.snapshot_path.clone()));
    let oauth = Arc::new(OAuthProvider::new(temp.path().join("oauth.json")));
    let scoped_tokens = Arc::new(ScopedTokenManager::new(&config.token_secret));
    let sessions = Arc::new(SessionManager::new(
        config.session_timeout,
        config.max_sessions,
        config.max_sse_per_session,
    ));
    let usage = Arc::new(UsageMeter::default());
    let audit = Arc::new(AuditLogger::default());

    let proxy = Arc::new(Proxy::from_spec(
        config.backend.as_ref().unwrap(),
        config.forward_timeout,
    ));
    proxy.start().await;

    let gate = Arc::new(Gate::new(
        GateSettings {
            pricing: config.pricing.clone(),
            global_rate_limit: config.global_rate_limit,
            tool_rate_limits: config.tool_rate_limits.clone(),
            free_methods: config.free_methods.clone(),
            refund_on_failure: config.refund_on_failure,
            shadow_mode: config.shadow_mode,
            forward_timeout: config.forward_timeout,
        },
        Arc::clone(&key_store),
        Arc::new(RateLimiter::new()),
        QuotaTracker::new(config.global_quota),
        Arc::clone(&proxy),
        Arc::new(NoopTeamChecker),
        Arc::new(NoopGroupManager),
        Arc::new(NoopPluginManager),
        Arc::clone(&usage),
        Arc::clone(&audit),
        WebhookEmitter::new(None),
        None,
    ));

    let state = AppState {
        config,
        key_store,
        gate,
        proxy,
        sessions,
        scoped_tokens,
        oauth,
        usage,
        audit,
        redis: None,
        draining: Arc::new(AtomicBool::new(false)),
        maintenance: Arc::new(RwLock::new(None)),
        started_at: Instant::now(),
    };

    let server = TestServer::new(create_app(state.clone())).unwrap();
    Harness { server, state }
}

fn tool_call(tool: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": {"name": tool, "arguments": {"q": "hi"}}
    })
}

fn fund_key(state: &AppState, credits: u64) -> String {
    state
        .key_store
        .create(CreateKeyOptions {
            name: "it-key".into(),
            credits,
            ..Default::default()
        })
        .unwrap()
        .key
}

#[tokio::test]
async fn test_metered_call_charges_and_stamps_headers() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;
    let key = fund_key(&h.state, 10);

    let response = h
        .server
        .post("/mcp")
        .add_header(name("x-api-key"), value(&key))
        .json(&tool_call("echo"))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body.get("error").is_none() || body["error"].is_null());

    // metering + correlation headers
    assert_eq!(response.headers().get("x-credits-remaining").unwrap(), "7");
    assert!(!response.headers().get("mcp-session-id").unwrap().is_empty());
    assert!(!response.headers().get("x-request-id").unwrap().is_empty());
    assert_eq!(response.headers().get("x-gateway").unwrap(), "paygate-test");

    let record = h.state.key_store.get_raw(&key).unwrap();
    assert_eq!(record.credits, 7);
    assert_eq!(record.total_calls, 1);
}

#[tokio::test]
async fn test_insufficient_credits_payment_body() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;
    let key = fund_key(&h.state, 2);

    let response = h
        .server
        .post("/mcp")
        .add_header(name("x-api-key"), value(&key))
        .json(&tool_call("echo"))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], -32402);
    assert_eq!(body["error"]["message"], "insufficient_credits");
    assert_eq!(body["error"]["data"]["creditsNeeded"], 3);
    assert_eq!(body["error"]["data"]["creditsAvailable"], 2);
    assert_eq!(body["error"]["data"]["topUpEndpoint"], "/topup");
}

#[tokio::test]
async fn test_missing_key_denied_without_charge() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;

    let response = h.server.post("/mcp").json(&tool_call("echo")).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], -32003);
    assert_eq!(body["error"]["message"], "invalid_api_key");
}

#[tokio::test]
async fn test_malformed_json_is_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;

    let response = h
        .server
        .post("/mcp")
        .add_header(name("content-type"), value("application/json"))
        .text("{not json")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], -32700);
}

#[tokio::test]
async fn test_sse_response_framing() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;
    let key = fund_key(&h.state, 10);

    let response = h
        .server
        .post("/mcp")
        .add_header(name("x-api-key"), value(&key))
        .add_header(name("accept"), value("text/event-stream"))
        .json(&tool_call("echo"))
        .await;

    response.assert_status_ok();
    assert!(response
        .headers().get("content-type").unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let text = response.text();
    assert!(text.contains("event: message"));
    assert!(text.contains("\"jsonrpc\""));
}

#[tokio::test]
async fn test_session_lifecycle() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;
    let key = fund_key(&h.state, 30);

    let first = h
        .server
        .post("/mcp")
        .add_header(name("x-api-key"), value(&key))
        .json(&tool_call("echo"))
        .await;
    let session = first.headers().get("mcp-session-id").unwrap().to_str().unwrap().to_string();
    assert!(session.starts_with("mcp_sess_"));

    // the session id is honored across calls
    let second = h
        .server
        .post("/mcp")
        .add_header(name("x-api-key"), value(&key))
        .add_header(name("mcp-session-id"), value(&session))
        .json(&tool_call("echo"))
        .await;
    assert_eq!(second.headers().get("mcp-session-id").unwrap().to_str().unwrap(), session);

    // DELETE tears it down
    let deleted = h
        .server
        .delete("/mcp")
        .add_header(name("mcp-session-id"), value(&session))
        .await;
    deleted.assert_status(StatusCode::NO_CONTENT);
    assert!(h.state.sessions.get_session(&session).is_none());

    let gone = h
        .server
        .delete("/mcp")
        .add_header(name("mcp-session-id"), value(&session))
        .await;
    gone.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scoped_token_issue_and_narrowing() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;
    let key = fund_key(&h.state, 30);

    let issued = h
        .server
        .post("/tokens")
        .add_header(name("x-api-key"), value(&key))
        .json(&json!({"ttlSecs": 600, "allowedTools": ["echo"], "label": "ci"}))
        .await;
    issued.assert_status(StatusCode::CREATED);
    let token = issued.json::<Value>()["token"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(token.starts_with("pgt_"));

    // allowed tool passes
    let ok = h
        .server
        .post("/mcp")
        .add_header(name("authorization"), value(&format!("Bearer {token}")))
        .json(&tool_call("echo"))
        .await;
    assert!(ok
        .json::<Value>()
        .get("error")
        .map_or(true, |e| e.is_null()));

    // tool outside the narrowing is -32003
    let denied = h
        .server
        .post("/mcp")
        .add_header(name("authorization"), value(&format!("Bearer {token}")))
        .json(&tool_call("other"))
        .await;
    let body: Value = denied.json();
    assert_eq!(body["error"]["code"], -32003);
    assert_eq!(body["error"]["message"], "tool_not_allowed");

    // revocation takes effect immediately
    let revoked = h
        .server
        .delete("/tokens")
        .json(&json!({"token": token}))
        .await;
    revoked.assert_status(StatusCode::NO_CONTENT);
    let after = h
        .server
        .post("/mcp")
        .add_header(name("authorization"), value(&format!("Bearer {token}")))
        .json(&tool_call("echo"))
        .await;
    assert_eq!(after.json::<Value>()["error"]["code"], -32003);
}

#[tokio::test]
async fn test_oauth_flow_end_to_end() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;
    let key = fund_key(&h.state, 30);

    let registered = h
        .server
        .post("/oauth/register")
        .json(&json!({
            "client_name": "it-app",
            "redirect_uris": ["https://app.example/cb"],
            "scopes": ["tools"],
            "api_key_ref": key,
        }))
        .await;
    registered.assert_status(StatusCode::CREATED);
    let client: Value = registered.json();
    let client_id = client["clientId"].as_str().unwrap().to_string();
    let client_secret = client["clientSecret"].as_str().unwrap().to_string();

    let authorized = h
        .server
        .get("/oauth/authorize")
        .add_query_param("client_id", &client_id)
        .add_query_param("redirect_uri", "https://app.example/cb")
        .add_query_param("response_type", "code")
        .add_query_param("scope", "tools")
        .add_query_param("state", "xyz")
        .add_query_param("code_challenge", "plain-challenge")
        .add_query_param("code_challenge_method", "plain")
        .await;
    authorized.assert_status(StatusCode::SEE_OTHER);
    let location = authorized.headers().get("location").unwrap().to_str().unwrap().to_string();
    assert!(location.contains("state=xyz"));
    let code = location
        .split("code=")
        .nth(1)
        .unwrap()
        .split('&')
        .next()
        .unwrap()
        .to_string();

    let exchanged = h
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("redirect_uri", "https://app.example/cb"),
            ("client_id", &client_id),
            ("client_secret", &client_secret),
            ("code_verifier", "plain-challenge"),
        ])
        .await;
    exchanged.assert_status_ok();
    let tokens: Value = exchanged.json();
    let access = tokens["access_token"].as_str().unwrap().to_string();

    // the bearer meters against the backing key
    let called = h
        .server
        .post("/mcp")
        .add_header(name("authorization"), value(&format!("Bearer {access}")))
        .json(&tool_call("echo"))
        .await;
    called.assert_status_ok();
    assert!(called
        .json::<Value>()
        .get("error")
        .map_or(true, |e| e.is_null()));
    assert_eq!(h.state.key_store.get_raw(&key).unwrap().credits, 27);
}

#[tokio::test]
async fn test_discovery_endpoints() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;

    let wk = h.server.get("/.well-known/mcp-payment").await;
    wk.assert_status_ok();
    let meta: Value = wk.json();
    assert_eq!(meta["billingModel"], "credits");
    assert_eq!(meta["paymentErrorCode"], -32402);
    assert_eq!(meta["defaultPrice"], 3);

    let pricing = h.server.get("/pricing").await;
    pricing.assert_status_ok();
    assert!(pricing.json::<Value>().get("tools").is_some());

    let health = h.server.get("/health").await;
    health.assert_status_ok();
    assert_eq!(health.json::<Value>()["status"], "ok");

    let metrics = h.server.get("/metrics").await;
    metrics.assert_status_ok();
    assert!(metrics.text().contains("paygate_"));
}

#[tokio::test]
async fn test_balance_endpoint() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;
    let key = fund_key(&h.state, 12);

    let anonymous = h.server.get("/balance").await;
    anonymous.assert_status(StatusCode::UNAUTHORIZED);

    let keyed = h
        .server
        .get("/balance")
        .add_header(name("x-api-key"), value(&key))
        .await;
    keyed.assert_status_ok();
    let body: Value = keyed.json();
    assert_eq!(body["credits"], 12);
    assert_eq!(body["totalSpent"], 0);
}

#[tokio::test]
async fn test_draining_returns_503() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;
    h.state.draining.store(true, Ordering::Release);

    let response = h.server.post("/mcp").json(&tool_call("echo")).await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);

    // discovery stays up while draining
    let health = h.server.get("/health").await;
    health.assert_status_ok();
}

#[tokio::test]
async fn test_maintenance_mode_body() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;
    *h.state.maintenance.write().unwrap() = Some("back at 02:00 UTC".into());

    let response = h.server.post("/mcp").json(&tool_call("echo")).await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text(), "back at 02:00 UTC");
}

#[tokio::test]
async fn test_free_methods_unmetered() {
    let temp = tempfile::tempdir().unwrap();
    let h = harness(&temp).await;

    // no key at all: ping passes through the echo backend
    let response = h
        .server
        .post("/mcp")
        .json(&json!({"jsonrpc": "2.0", "id": 5, "method": "ping"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body.get("error").map_or(true, |e| e.is_null()));
}
