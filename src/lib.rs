pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::config::GatewayConfig;
use crate::services::audit::AuditLogger;
use crate::services::gate::Gate;
use crate::services::key_store::KeyStore;
use crate::services::oauth::OAuthProvider;
use crate::services::proxy::Proxy;
use crate::services::redis_sync::RedisSync;
use crate::services::scoped_token::ScopedTokenManager;
use crate::services::session::SessionManager;
use crate::services::usage::UsageMeter;

/// Everything the handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub key_store: Arc<KeyStore>,
    pub gate: Arc<Gate>,
    pub proxy: Arc<Proxy>,
    pub sessions: Arc<SessionManager>,
    pub scoped_tokens: Arc<ScopedTokenManager>,
    pub oauth: Arc<OAuthProvider>,
    pub usage: Arc<UsageMeter>,
    pub audit: Arc<AuditLogger>,
    pub redis: Option<Arc<RedisSync>>,
    /// Set during graceful shutdown; `/mcp` answers 503 while draining.
    pub draining: Arc<AtomicBool>,
    /// Maintenance mode body; `Some` puts `/mcp` into 503.
    pub maintenance: Arc<RwLock<Option<String>>>,
    pub started_at: Instant,
}

/// Build the public router. Metrics and request-id sit outermost, then
/// operator headers, CORS, and the body-size cap.
pub fn create_app(state: AppState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::error!("invalid CORS origin '{origin}': {e}");
                    None
                }
            })
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                header::ACCEPT,
                HeaderName::from_static("x-api-key"),
                HeaderName::from_static("mcp-session-id"),
            ])
    };

    // operator-configured response headers, validated at config parse time
    let custom_headers: Arc<Vec<(HeaderName, HeaderValue)>> = Arc::new(
        state
            .config
            .custom_headers
            .iter()
            .filter_map(|(name, value)| {
                Some((
                    HeaderName::try_from(name.as_str()).ok()?,
                    HeaderValue::try_from(value.as_str()).ok()?,
                ))
            })
            .collect(),
    );
    let header_layer = axum::middleware::from_fn(
        move |request: axum::extract::Request, next: axum::middleware::Next| {
            let headers = Arc::clone(&custom_headers);
            async move {
                let mut response = next.run(request).await;
                for (name, value) in headers.iter() {
                    response.headers_mut().insert(name.clone(), value.clone());
                }
                response
            }
        },
    );

    let max_body = state.config.max_body_bytes;

    Router::new()
        .route(
            "/mcp",
            post(handlers::mcp::post_mcp)
                .get(handlers::mcp::get_mcp)
                .delete(handlers::mcp::delete_mcp),
        )
        .route(
            "/.well-known/mcp-payment",
            get(handlers::discovery::well_known),
        )
        .route("/pricing", get(handlers::discovery::pricing))
        .route("/health", get(handlers::discovery::health))
        .route("/balance", get(handlers::discovery::balance))
        .route(
            "/tokens",
            post(handlers::tokens::issue_token).delete(handlers::tokens::revoke_token),
        )
        .nest(
            "/oauth",
            Router::new()
                .route("/register", post(handlers::oauth::register))
                .route("/authorize", get(handlers::oauth::authorize))
                .route("/token", post(handlers::oauth::token))
                .route("/revoke", post(handlers::oauth::revoke)),
        )
        .route("/metrics", get(middleware::metrics::metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(
                    middleware::metrics::metrics_middleware,
                ))
                .layer(axum::middleware::from_fn(
                    middleware::request_id::request_id_middleware,
                ))
                .layer(header_layer)
                .layer(cors)
                .layer(DefaultBodyLimit::max(max_body)),
        )
        .with_state(state)
}
