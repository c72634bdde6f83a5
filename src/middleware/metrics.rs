// ============================================================================
// Prometheus Metrics - Gateway Observability
// ============================================================================
//
// ## Metrics Exposed (all `paygate_` prefixed):
//
// Counters:
//   - paygate_tool_calls_total{tool,status}
//   - paygate_credits_charged_total{tool}
//   - paygate_denials_total{reason}
//   - paygate_http_requests_total{method,path,status}
//   - paygate_rate_limit_hits_total{tool}
//   - paygate_refunds_total{tool}
//
// Gauges:
//   - paygate_uptime_seconds
//   - paygate_active_keys_total
//   - paygate_active_sessions_total
//   - paygate_total_credits_available
//
// Tool and reason labels come from request content, so each counter caps
// its label-set cardinality at 10 000; new combinations past the cap are
// dropped silently. The serialized exposition is capped at 5 MiB.
//
// ============================================================================

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashSet;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder,
};
use std::time::Instant;

/// Label-set cap per counter.
const MAX_LABEL_SETS: usize = 10_000;
/// Exposition size cap.
const MAX_EXPOSITION_BYTES: usize = 5 * 1024 * 1024;

lazy_static! {
    pub static ref TOOL_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "paygate_tool_calls_total",
        "Tool calls by tool and outcome",
        &["tool", "status"]
    )
    .unwrap();

    pub static ref CREDITS_CHARGED_TOTAL: CounterVec = register_counter_vec!(
        "paygate_credits_charged_total",
        "Credits charged per tool",
        &["tool"]
    )
    .unwrap();

    pub static ref DENIALS_TOTAL: CounterVec = register_counter_vec!(
        "paygate_denials_total",
        "Denied calls by reason",
        &["reason"]
    )
    .unwrap();

    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "paygate_http_requests_total",
        "HTTP requests by method, path and status",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref RATE_LIMIT_HITS_TOTAL: CounterVec = register_counter_vec!(
        "paygate_rate_limit_hits_total",
        "Rate-limited calls per tool",
        &["tool"]
    )
    .unwrap();

    pub static ref REFUNDS_TOTAL: CounterVec = register_counter_vec!(
        "paygate_refunds_total",
        "Refunded calls per tool",
        &["tool"]
    )
    .unwrap();

    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "paygate_uptime_seconds",
        "Seconds since gateway start"
    )
    .unwrap();

    pub static ref ACTIVE_KEYS_TOTAL: Gauge = register_gauge!(
        "paygate_active_keys_total",
        "Usable API keys"
    )
    .unwrap();

    pub static ref ACTIVE_SESSIONS_TOTAL: Gauge = register_gauge!(
        "paygate_active_sessions_total",
        "Live MCP sessions"
    )
    .unwrap();

    pub static ref TOTAL_CREDITS_AVAILABLE: Gauge = register_gauge!(
        "paygate_total_credits_available",
        "Sum of credits over all keys"
    )
    .unwrap();

    /// `counter\x1flabel…` combinations already admitted.
    static ref SEEN_LABEL_SETS: DashSet<String> = DashSet::new();
}

/// Admit a label combination unless the per-counter cap is exhausted.
/// Dropped combinations are silent per the cardinality policy.
fn labels_admitted(counter: &str, labels: &[&str]) -> bool {
    let key = format!("{counter}\x1f{}", labels.join("\x1f"));
    if SEEN_LABEL_SETS.contains(&key) {
        return true;
    }
    let in_counter = SEEN_LABEL_SETS
        .iter()
        .filter(|k| k.starts_with(counter))
        .count();
    if in_counter >= MAX_LABEL_SETS {
        return false;
    }
    SEEN_LABEL_SETS.insert(key);
    true
}

pub fn record_tool_call(tool: &str, status: &str) {
    if labels_admitted("tool_calls", &[tool, status]) {
        TOOL_CALLS_TOTAL.with_label_values(&[tool, status]).inc();
    }
}

pub fn record_credits_charged(tool: &str, credits: u64) {
    if credits > 0 && labels_admitted("credits_charged", &[tool]) {
        CREDITS_CHARGED_TOTAL
            .with_label_values(&[tool])
            .inc_by(credits as f64);
    }
}

pub fn record_denial(reason: &str) {
    if labels_admitted("denials", &[reason]) {
        DENIALS_TOTAL.with_label_values(&[reason]).inc();
    }
}

pub fn record_rate_limit_hit(tool: &str) {
    if labels_admitted("rate_limit_hits", &[tool]) {
        RATE_LIMIT_HITS_TOTAL.with_label_values(&[tool]).inc();
    }
}

pub fn record_refund(tool: &str) {
    if labels_admitted("refunds", &[tool]) {
        REFUNDS_TOTAL.with_label_values(&[tool]).inc();
    }
}

/// Collapse everything outside the known route set so the http counter's
/// `path` label stays bounded regardless of what clients request.
fn normalize_path(path: &str) -> String {
    match path {
        "/mcp" | "/metrics" | "/health" | "/pricing" | "/balance" | "/tokens"
        | "/.well-known/mcp-payment" | "/oauth/register" | "/oauth/authorize"
        | "/oauth/token" | "/oauth/revoke" => path.to_string(),
        _ => "/other".to_string(),
    }
}

/// Request counting middleware, applied to the whole router.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    if labels_admitted("http_requests", &[method.as_str(), &path, &status]) {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&[method.as_str(), &path, &status])
            .inc();
    }
    tracing::debug!(
        target: "metrics",
        method = %method,
        path = %path,
        status = %status,
        duration_ms = %started.elapsed().as_millis(),
        "request metered"
    );

    response
}

/// Prometheus text exposition, size-capped.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => {
            if buffer.len() > MAX_EXPOSITION_BYTES {
                buffer.truncate(MAX_EXPOSITION_BYTES);
            }
            (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                buffer,
            )
        }
        Err(e) => {
            tracing::error!("failed to encode metrics: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                format!("encode error: {e}").into_bytes(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_record() {
        record_tool_call("unit_test_tool", "ok");
        record_credits_charged("unit_test_tool", 5);
        record_denial("unit_test_reason");
        record_rate_limit_hit("unit_test_tool");
        record_refund("unit_test_tool");
        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "paygate_tool_calls_total"));
    }

    #[test]
    fn test_zero_credit_charge_not_counted() {
        let before = CREDITS_CHARGED_TOTAL
            .with_label_values(&["zero_tool"])
            .get();
        record_credits_charged("zero_tool", 0);
        // counting zero would register the label set for nothing
        let after = CREDITS_CHARGED_TOTAL
            .with_label_values(&["zero_tool"])
            .get();
        assert_eq!(before, after);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/mcp"), "/mcp");
        assert_eq!(normalize_path("/oauth/token"), "/oauth/token");
        assert_eq!(normalize_path("/anything/else/123"), "/other");
        // unknown oauth suffixes must not mint fresh label values
        assert_eq!(normalize_path("/oauth/probe-123"), "/other");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_responds() {
        record_tool_call("endpoint_test", "ok");
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_label_admission_is_sticky() {
        assert!(labels_admitted("sticky_test", &["a"]));
        assert!(labels_admitted("sticky_test", &["a"]));
    }
}
