//! OAuth 2.1 HTTP surface
//!
//! Dynamic client registration, the authorization redirect, the token
//! endpoint (authorization_code + refresh_token grants) and RFC 7009
//! revocation. Token errors use the standard OAuth error body shape.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Form, Json};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::json;

use crate::services::oauth::OAuthError;
use crate::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// The API key this client's tokens bill against.
    pub api_key_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code_challenge: String,
    #[serde(default = "default_challenge_method")]
    pub code_challenge_method: String,
}

fn default_challenge_method() -> String {
    "S256".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub redirect_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub code_verifier: String,
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub token: String,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Response {
    if body.redirect_uris.is_empty() {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_client_metadata");
    }
    for uri in &body.redirect_uris {
        if url::Url::parse(uri).is_err() {
            return oauth_error(StatusCode::BAD_REQUEST, "invalid_redirect_uri");
        }
    }
    if state.key_store.get_raw(&body.api_key_ref).is_none() {
        return oauth_error(StatusCode::BAD_REQUEST, "unknown api_key_ref");
    }

    let client = state.oauth.register_client(
        body.client_name,
        body.redirect_uris,
        body.scopes,
        body.api_key_ref,
    );
    state
        .audit
        .log("oauth_client_registered", &client.client_name, &client.client_id, json!({}));
    (StatusCode::CREATED, Json(client)).into_response()
}

/// The authorization endpoint. On success the user agent is redirected back
/// with `code` (and `state` echoed).
pub async fn authorize(
    State(state): State<AppState>,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    if !query.response_type.is_empty() && query.response_type != "code" {
        return oauth_error(StatusCode::BAD_REQUEST, "unsupported_response_type");
    }

    match state.oauth.authorize(
        &query.client_id,
        &query.redirect_uri,
        &query.scope,
        &query.code_challenge,
        &query.code_challenge_method,
    ) {
        Ok(code) => {
            // codes use an unreserved alphabet; only state needs escaping
            let mut location = format!("{}?code={}", query.redirect_uri, code);
            if let Some(ref s) = query.state {
                location.push_str(&format!(
                    "&state={}",
                    utf8_percent_encode(s, NON_ALPHANUMERIC)
                ));
            }
            Redirect::to(&location).into_response()
        }
        Err(e) => oauth_error(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

pub async fn token(State(state): State<AppState>, Form(body): Form<TokenRequest>) -> Response {
    let result = match body.grant_type.as_str() {
        "authorization_code" => state.oauth.exchange_code(
            &body.client_id,
            &body.client_secret,
            &body.code,
            &body.redirect_uri,
            &body.code_verifier,
        ),
        "refresh_token" => state.oauth.refresh(&body.client_id, &body.refresh_token),
        _ => return oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type"),
    };

    match result {
        Ok(tokens) => Json(tokens).into_response(),
        Err(OAuthError::UnknownClient) | Err(OAuthError::BadClientSecret) => {
            oauth_error(StatusCode::UNAUTHORIZED, "invalid_client")
        }
        Err(e) => {
            tracing::debug!("token exchange refused: {e}");
            oauth_error(StatusCode::BAD_REQUEST, "invalid_grant")
        }
    }
}

/// RFC 7009: revocation always answers 200, even for unknown tokens.
pub async fn revoke(State(state): State<AppState>, Form(body): Form<RevokeRequest>) -> Response {
    let removed = state.oauth.revoke_token(&body.token);
    if removed {
        state
            .audit
            .log("oauth_token_revoked", "oauth", "token revoked", json!({}));
    }
    StatusCode::OK.into_response()
}

fn oauth_error(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}
