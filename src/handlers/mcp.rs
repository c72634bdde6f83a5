/// The `/mcp` front door: auth extraction, session correlation, SSE framing
///
/// `POST /mcp` carries one JSON-RPC request and answers JSON or a single
/// SSE `message` event depending on `Accept`. `GET /mcp` opens a long-lived
/// notification stream under a session. `DELETE /mcp` tears the session
/// down. Metered responses carry the rate-limit triplet and
/// `X-Credits-Remaining`.
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::middleware::client_ip::client_ip_from;
use crate::middleware::error_handling::AppError;
use crate::models::rpc::{JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};
use crate::services::gate::{CallContext, GateOutcome, RateMeter};
use crate::AppState;

pub const SESSION_HEADER: &str = "mcp-session-id";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(30);

pub async fn post_mcp(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(unavailable) = service_unavailable(&state) {
        return unavailable;
    }

    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("unparseable JSON-RPC body: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::error(None, PARSE_ERROR, "parse error")),
            )
                .into_response();
        }
    };

    let (api_key, scoped_tools) = resolve_auth(&state, &headers);
    let session_id = resolve_session(&state, &headers, api_key.as_deref());
    let client_ip = peer_ip(&state, &headers, connect);

    let outcome = state
        .gate
        .evaluate(
            request,
            CallContext {
                api_key,
                client_ip: Some(client_ip),
                scoped_tools,
            },
        )
        .await;

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response_headers.insert(SESSION_HEADER, value);
    }
    apply_meter_headers(&mut response_headers, &outcome);

    if wants_sse(&headers) {
        let payload = serde_json::to_string(&outcome.response).unwrap_or_default();
        let event_stream =
            stream::iter([Ok::<Event, Infallible>(Event::default()
                .event("message")
                .data(payload))]);
        (response_headers, Sse::new(event_stream)).into_response()
    } else {
        (response_headers, Json(outcome.response)).into_response()
    }
}

/// Long-lived SSE stream for server-initiated notifications.
pub async fn get_mcp(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(unavailable) = service_unavailable(&state) {
        return unavailable;
    }

    let (api_key, _) = resolve_auth(&state, &headers);
    let session_id = resolve_session(&state, &headers, api_key.as_deref());

    let Some(rx) = state.sessions.add_sse_connection(&session_id) else {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "SSE connection limit reached for session",
        )
            .into_response();
    };

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response_headers.insert(SESSION_HEADER, value);
    }

    let event_stream = ReceiverStream::new(rx).map(|payload| {
        Ok::<Event, Infallible>(
            Event::default()
                .event("message")
                .data(payload.to_string()),
        )
    });

    (
        response_headers,
        Sse::new(event_stream)
            .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("")),
    )
        .into_response()
}

/// Terminate a session; closes every SSE stream bound to it.
pub async fn delete_mcp(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_str(&headers, SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "Mcp-Session-Id header required").into_response();
    };
    if state.sessions.destroy_session(session_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "unknown session").into_response()
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn service_unavailable(state: &AppState) -> Option<Response> {
    if state.draining.load(Ordering::Acquire) {
        return Some(AppError::ServiceUnavailable("gateway is draining".to_string()).into_response());
    }
    // maintenance mode carries an operator-configured body verbatim
    if let Some(body) = state.maintenance.read().unwrap().clone() {
        return Some((StatusCode::SERVICE_UNAVAILABLE, body).into_response());
    }
    None
}

/// Unify the three credential kinds: long-lived keys (`X-API-Key`),
/// scoped tokens (`Bearer pgt_…`) and OAuth access tokens (other bearers).
fn resolve_auth(state: &AppState, headers: &HeaderMap) -> (Option<String>, Option<Vec<String>>) {
    if let Some(key) = header_str(headers, "x-api-key") {
        return (Some(key.to_string()), None);
    }

    let Some(bearer) = header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
    else {
        return (None, None);
    };

    if bearer.starts_with(crate::services::scoped_token::TOKEN_PREFIX) {
        return match state.scoped_tokens.validate(bearer) {
            Ok(claims) => (Some(claims.api_key), claims.allowed_tools),
            Err(e) => {
                tracing::debug!("scoped token rejected: {e}");
                (None, None)
            }
        };
    }

    match state.oauth.validate(bearer) {
        Some(access) => (Some(access.api_key), None),
        None => (None, None),
    }
}

/// Honor a valid presented session id, otherwise create one.
fn resolve_session(state: &AppState, headers: &HeaderMap, api_key: Option<&str>) -> String {
    if let Some(id) = header_str(headers, SESSION_HEADER) {
        if state.sessions.get_session(id).is_some() {
            if let Some(key) = api_key {
                state.sessions.bind_api_key(id, key);
            }
            return id.to_string();
        }
    }
    state.sessions.create_session(api_key.map(String::from))
}

fn peer_ip(
    state: &AppState,
    headers: &HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> IpAddr {
    let peer = connect
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));
    client_ip_from(headers, peer, &state.config.trusted_proxies)
}

fn apply_meter_headers(headers: &mut HeaderMap, outcome: &GateOutcome) {
    if let Some(RateMeter {
        limit,
        remaining,
        reset_in_ms,
    }) = outcome.meter
    {
        let reset_secs = reset_in_ms.div_ceil(1000);
        headers.insert("x-ratelimit-limit", header_num(limit as u64));
        headers.insert("x-ratelimit-remaining", header_num(remaining as u64));
        headers.insert("x-ratelimit-reset", header_num(reset_secs));
    }
    if let Some(credits) = outcome.credits_remaining {
        headers.insert("x-credits-remaining", header_num(credits));
    }
}

fn header_num(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).expect("numeric header value")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn wants_sse(headers: &HeaderMap) -> bool {
    header_str(headers, "accept")
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wants_sse() {
        let mut headers = HeaderMap::new();
        assert!(!wants_sse(&headers));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        assert!(!wants_sse(&headers));
        headers.insert(
            "accept",
            HeaderValue::from_static("text/event-stream, application/json"),
        );
        assert!(wants_sse(&headers));
    }

    #[test]
    fn test_meter_headers_rounding() {
        let mut headers = HeaderMap::new();
        let outcome = GateOutcome {
            response: JsonRpcResponse::success(None, serde_json::json!({})),
            meter: Some(RateMeter {
                limit: 10,
                remaining: 3,
                reset_in_ms: 1_001,
            }),
            credits_remaining: Some(42),
        };
        apply_meter_headers(&mut headers, &outcome);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "3");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "2");
        assert_eq!(headers.get("x-credits-remaining").unwrap(), "42");
    }
}
