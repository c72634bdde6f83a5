//! Scoped-token issue and revoke endpoints
//!
//! A key holder can mint short-lived delegated tokens narrowed to a tool
//! subset, and revoke them early. Revocations are announced to replicas so
//! every peer grows its revocation list.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::services::scoped_token::{fingerprint, MAX_TTL_SECS};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenRequest {
    #[serde(default = "default_ttl")]
    pub ttl_secs: i64,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_ttl() -> i64 {
    3600
}

#[derive(Debug, Deserialize)]
pub struct RevokeTokenRequest {
    pub token: String,
}

/// `POST /tokens` — mint a delegated token for the presented key.
pub async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IssueTokenRequest>,
) -> Response {
    let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::UNAUTHORIZED, "X-API-Key required").into_response();
    };
    // only a live key may delegate
    let Some(record) = state.key_store.get(api_key) else {
        return (StatusCode::UNAUTHORIZED, "invalid API key").into_response();
    };

    let token = state.scoped_tokens.issue(
        &record.key,
        body.ttl_secs,
        body.allowed_tools.clone(),
        body.label.clone(),
    );
    let claims = state
        .scoped_tokens
        .validate(&token)
        .expect("freshly issued token validates");

    state.audit.log(
        "scoped_token_issued",
        &record.name,
        body.label.as_deref().unwrap_or(""),
        json!({"tools": body.allowed_tools}),
    );

    (
        StatusCode::CREATED,
        Json(json!({
            "token": token,
            "expiresAt": claims.expires_at,
            "allowedTools": claims.allowed_tools,
        })),
    )
        .into_response()
}

/// `DELETE /tokens` — revoke a delegated token ahead of its expiry.
pub async fn revoke_token(
    State(state): State<AppState>,
    Json(body): Json<RevokeTokenRequest>,
) -> Response {
    state.scoped_tokens.revoke(&body.token);

    // replicas learn the fingerprint, never the token
    if let Some(redis) = &state.redis {
        let fp = fingerprint(&body.token);
        let expires_at = Utc::now() + ChronoDuration::seconds(MAX_TTL_SECS);
        let redis = redis.clone();
        tokio::spawn(async move {
            redis.publish_token_revoked(&fp, expires_at).await;
        });
    }

    state
        .audit
        .log("scoped_token_revoked", "api", "token revoked", json!({}));
    StatusCode::NO_CONTENT.into_response()
}
