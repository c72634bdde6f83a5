/// Public discovery and status endpoints
///
/// `/.well-known/mcp-payment` and `/pricing` are unauthenticated by design:
/// a client needs them to decide whether and how to pay before it holds any
/// credential. `/balance` requires the key it reports on.
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::middleware::metrics;
use crate::models::rpc::{JsonRpcRequest, PAYMENT_REQUIRED};
use crate::AppState;

/// Spec revision advertised to clients.
const PAYMENT_SPEC_VERSION: &str = "SEP-2007/1";
const DISCOVERY_LIST_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn well_known(State(state): State<AppState>) -> Json<Value> {
    Json(server_metadata(&state, tool_count(&state).await))
}

/// Metadata plus the per-tool pricing list.
pub async fn pricing(State(state): State<AppState>) -> Json<Value> {
    let tools = list_backend_tools(&state).await;
    let pricing = &state.config.pricing;

    let per_tool: Vec<Value> = tools
        .iter()
        .map(|name| {
            json!({
                "tool": name,
                "credits": pricing.base_price(name),
                "perKb": pricing.per_kb_price,
            })
        })
        .collect();

    let mut body = server_metadata(&state, tools.len());
    if let Some(obj) = body.as_object_mut() {
        obj.insert("tools".to_string(), json!(per_tool));
    }
    Json(body)
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let redis_healthy = state.redis.as_ref().map(|r| r.is_healthy());
    let backend_running = state.proxy.is_running();
    let degraded = !backend_running || redis_healthy == Some(false);

    // gauges refresh on scrape-adjacent traffic
    metrics::UPTIME_SECONDS.set(state.started_at.elapsed().as_secs_f64());
    metrics::ACTIVE_KEYS_TOTAL.set(state.key_store.active_key_count() as f64);
    metrics::ACTIVE_SESSIONS_TOTAL.set(state.sessions.active_count() as f64);
    metrics::TOTAL_CREDITS_AVAILABLE.set(state.key_store.total_credits() as f64);

    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "backendRunning": backend_running,
        "redisHealthy": redis_healthy,
        "draining": state.draining.load(Ordering::Acquire),
        "activeSessions": state.sessions.active_count(),
        "activeKeys": state.key_store.active_key_count(),
    }))
}

/// Balance for the presented key (`X-API-Key` or a bearer that resolves to
/// one). Referenced from the -32402 body as `balanceEndpoint`.
pub async fn balance(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| {
            let bearer = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))?;
            if bearer.starts_with(crate::services::scoped_token::TOKEN_PREFIX) {
                state
                    .scoped_tokens
                    .validate(bearer)
                    .ok()
                    .map(|c| c.api_key)
            } else {
                state.oauth.validate(bearer).map(|a| a.api_key)
            }
        });

    let Some(record) = api_key.and_then(|k| state.key_store.get(&k)) else {
        return (StatusCode::UNAUTHORIZED, "valid API key required").into_response();
    };

    Json(json!({
        "credits": record.credits,
        "totalSpent": record.total_spent,
        "totalCalls": record.total_calls,
        "spendingLimit": record.spending_limit,
    }))
    .into_response()
}

fn server_metadata(state: &AppState, tool_count: usize) -> Value {
    json!({
        "specVersion": PAYMENT_SPEC_VERSION,
        "billingModel": "credits",
        "defaultPrice": state.config.pricing.default_price,
        "perKbPrice": state.config.pricing.per_kb_price,
        "authMethods": ["api_key", "scoped_token", "oauth2"],
        "paymentErrorCode": PAYMENT_REQUIRED,
        "pricingEndpoint": "/pricing",
        "balanceEndpoint": "/balance",
        "topUpEndpoint": "/topup",
        "globalRateLimitPerMin": state.config.global_rate_limit,
        "toolCount": tool_count,
    })
}

async fn tool_count(state: &AppState) -> usize {
    list_backend_tools(state).await.len()
}

/// Best-effort `tools/list` against the backend; discovery stays useful
/// even when the backend is down.
async fn list_backend_tools(state: &AppState) -> Vec<String> {
    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: Some(json!("discovery")),
        method: "tools/list".to_string(),
        params: None,
    };
    match state.proxy.forward(&request, DISCOVERY_LIST_TIMEOUT).await {
        Ok(response) => response
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        Err(e) => {
            tracing::debug!("discovery tools/list failed: {e}");
            Vec::new()
        }
    }
}
