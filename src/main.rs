use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygate::config::GatewayConfig;
use paygate::services::audit::AuditLogger;
use paygate::services::gate::{Gate, GateSettings};
use paygate::services::hooks::{NoopGroupManager, NoopPluginManager, NoopTeamChecker};
use paygate::services::key_store::KeyStore;
use paygate::services::oauth::OAuthProvider;
use paygate::services::proxy::Proxy;
use paygate::services::quota::QuotaTracker;
use paygate::services::rate_limiter::RateLimiter;
use paygate::services::redis_sync::RedisSync;
use paygate::services::scoped_token::ScopedTokenManager;
use paygate::services::session::SessionManager;
use paygate::services::usage::UsageMeter;
use paygate::services::webhook::WebhookEmitter;
use paygate::{create_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "paygate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env()?;

    // KeyStore loads first; an unreadable snapshot aborts startup.
    let key_store = Arc::new(KeyStore::new(config.snapshot_path.clone()));
    let loaded = key_store.snapshot_load()?;
    tracing::info!("🔑 key store ready ({loaded} keys loaded)");
    key_store.spawn_flush_task(config.snapshot_flush_interval);

    let oauth_path = config
        .snapshot_path
        .parent()
        .map(|d| d.join("oauth.json"))
        .unwrap_or_else(|| "oauth.json".into());
    let oauth = Arc::new(OAuthProvider::new(oauth_path));
    match oauth.snapshot_load() {
        Ok(clients) => tracing::info!("🔐 oauth provider ready ({clients} clients)"),
        Err(e) => tracing::warn!("⚠️  oauth snapshot unreadable, starting empty: {e}"),
    }
    oauth.spawn_purge_task(Duration::from_secs(60));

    let scoped_tokens = Arc::new(ScopedTokenManager::new(&config.token_secret));
    scoped_tokens.spawn_purge_task(Duration::from_secs(300));

    let sessions = Arc::new(SessionManager::new(
        config.session_timeout,
        config.max_sessions,
        config.max_sse_per_session,
    ));
    sessions.spawn_sweeper();

    let redis = match &config.redis_url {
        Some(url) => match RedisSync::connect(url).await {
            Ok(sync) => {
                sync.spawn_subscriber(Arc::clone(&key_store), Arc::clone(&scoped_tokens));
                Some(sync)
            }
            Err(e) => {
                tracing::error!("❌ redis unreachable at startup, running local-only: {e}");
                None
            }
        },
        None => None,
    };

    // Backend proxy: single stdio/http, or the multi-server router.
    let proxy = Arc::new(if !config.backends.is_empty() {
        Proxy::multi(&config.backends, config.forward_timeout)
    } else if let Some(spec) = &config.backend {
        Proxy::from_spec(spec, config.forward_timeout)
    } else {
        anyhow::bail!("no backend configured: set PAYGATE_BACKEND or PAYGATE_BACKENDS");
    });
    proxy.start().await;
    tracing::info!("🔌 backend proxy started (running: {})", proxy.is_running());

    let usage = Arc::new(UsageMeter::default());
    let audit = Arc::new(AuditLogger::default());
    let webhooks = WebhookEmitter::new(config.webhook_url.clone());

    // auto top-ups surface as webhook events
    {
        let hook_webhooks = webhooks.clone();
        key_store.set_topup_hook(move |key, amount| {
            hook_webhooks.emit(
                "auto_topup",
                "key_store",
                serde_json::json!({"key": key, "amount": amount}),
            );
        });
    }

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
        webhooks.clone(),
        redis.clone(),
    ));
    if gate.shadow_mode() {
        tracing::warn!("⚠️  shadow mode is ON: decisions are observed but never enforced");
    }

    let draining = Arc::new(AtomicBool::new(false));
    let state = AppState {
        config: config.clone(),
        key_store: Arc::clone(&key_store),
        gate,
        proxy: Arc::clone(&proxy),
        sessions: Arc::clone(&sessions),
        scoped_tokens,
        oauth: Arc::clone(&oauth),
        usage,
        audit,
        redis,
        draining: Arc::clone(&draining),
        maintenance: Arc::new(RwLock::new(None)),
        started_at: Instant::now(),
    };

    let app = create_app(state);
    let addr: std::net::SocketAddr = config.server_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("🚀 PayGate listening on http://{addr}");

    let drain_deadline = config.drain_deadline;
    let shutdown_draining = Arc::clone(&draining);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // stop admitting /mcp traffic, then give in-flight calls a window
        shutdown_draining.store(true, Ordering::Release);
        tracing::info!(
            "draining: waiting up to {}s for in-flight calls",
            drain_deadline.as_secs()
        );
        tokio::time::sleep(drain_deadline).await;
    })
    .await?;

    // deterministic teardown: backend first, then persist state
    proxy.stop().await;
    if let Err(e) = key_store.flush_if_dirty() {
        tracing::error!("final snapshot flush failed: {e}");
    }
    if let Err(e) = oauth.flush_if_dirty() {
        tracing::error!("final oauth flush failed: {e}");
    }
    tracing::info!("👋 PayGate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
