/// Reverse proxy to backend MCP servers
///
/// One contract, three shapes behind a tagged union: a supervised child
/// process speaking newline-delimited JSON-RPC on stdio, an HTTP backend,
/// and a multi-server router that picks a backend per tool.
///
/// Credentials never cross this boundary: forwarded requests are rebuilt
/// from the JSON-RPC envelope alone, so `X-API-Key` and bearer headers
/// cannot leak to a backend.
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

use crate::config::{BackendSpec, RoutedBackend};
use crate::models::rpc::{JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS, METHOD_NOT_FOUND};

const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend not running")]
    NotRunning,
    #[error("backend call timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no backend routes tool {0}")]
    NoRoute(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Whether a backend JSON-RPC error is permanent (never refunded) or the
/// kind of failure `refundOnFailure` applies to.
pub fn is_permanent_backend_error(response: &JsonRpcResponse) -> bool {
    matches!(
        response.error_code(),
        Some(METHOD_NOT_FOUND) | Some(INVALID_PARAMS)
    )
}

pub enum Proxy {
    Stdio(StdioProxy),
    Http(HttpProxy),
    Multi(MultiProxy),
}

impl Proxy {
    pub fn from_spec(spec: &BackendSpec, timeout: Duration) -> Self {
        match spec {
            BackendSpec::Stdio { command, args } => {
                Proxy::Stdio(StdioProxy::new(command.clone(), args.clone()))
            }
            BackendSpec::Http { url } => Proxy::Http(HttpProxy::new(url.clone(), timeout)),
        }
    }

    pub fn multi(routed: &[RoutedBackend], timeout: Duration) -> Self {
        Proxy::Multi(MultiProxy::new(routed, timeout))
    }

    pub async fn start(&self) {
        match self {
            Proxy::Stdio(p) => p.start().await,
            Proxy::Http(_) => {}
            Proxy::Multi(p) => Box::pin(p.start()).await,
        }
    }

    pub async fn stop(&self) {
        match self {
            Proxy::Stdio(p) => p.stop().await,
            Proxy::Http(_) => {}
            Proxy::Multi(p) => Box::pin(p.stop()).await,
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Proxy::Stdio(p) => p.is_running(),
            Proxy::Http(_) => true,
            Proxy::Multi(p) => p.is_running(),
        }
    }

    /// Single dispatch point for all three shapes.
    pub async fn forward(
        &self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        match self {
            Proxy::Stdio(p) => p.forward(request, timeout).await,
            Proxy::Http(p) => p.forward(request).await,
            Proxy::Multi(p) => Box::pin(p.forward(request, timeout)).await,
        }
    }
}

// ============================================================================
// STDIO PROXY
// ============================================================================

struct StdioShared {
    stdin: Mutex<Option<ChildStdin>>,
    pending: DashMap<u64, (Option<Value>, oneshot::Sender<JsonRpcResponse>)>,
    running: AtomicBool,
    shutdown: AtomicBool,
}

/// Spawns and supervises a child process; multiplexes concurrent calls by
/// rewriting request ids and restoring them on the way back. Crashes
/// restart the child with exponential backoff and drop inflight promises.
pub struct StdioProxy {
    command: String,
    args: Vec<String>,
    shared: Arc<StdioShared>,
    next_id: AtomicU64,
}

impl StdioProxy {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            shared: Arc::new(StdioShared {
                stdin: Mutex::new(None),
                pending: DashMap::new(),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Launch the supervisor. Returns once the first spawn attempt happened.
    pub async fn start(&self) {
        self.shared.shutdown.store(false, Ordering::Release);
        let command = self.command.clone();
        let args = self.args.clone();
        let shared = Arc::clone(&self.shared);

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            let mut backoff = RESTART_BACKOFF_BASE;
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                match spawn_child(&command, &args, &shared).await {
                    Ok(mut child) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(());
                        }
                        backoff = RESTART_BACKOFF_BASE;
                        // run_reader returns when stdout closes (crash or exit)
                        run_reader(&shared, &mut child).await;
                        shared.running.store(false, Ordering::Release);
                        *shared.stdin.lock().await = None;
                        shared.pending.clear();
                        let _ = child.kill().await;
                        if shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        tracing::warn!(command = %command, "stdio backend exited, restarting");
                    }
                    Err(e) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(());
                        }
                        tracing::error!(command = %command, "failed to spawn stdio backend: {e}");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
            }
        });
        let _ = ready_rx.await;
    }

    pub async fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        *self.shared.stdin.lock().await = None;
        // dropping the senders resolves every inflight forward with an error
        self.shared.pending.clear();
    }

    pub async fn forward(
        &self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if !self.is_running() {
            return Err(ProxyError::NotRunning);
        }

        let internal_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut wire = request.clone();
        let original_id = wire.id.replace(json!(internal_id));

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(internal_id, (original_id, tx));

        let line = serde_json::to_string(&wire)
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        {
            let mut stdin = self.shared.stdin.lock().await;
            let Some(writer) = stdin.as_mut() else {
                self.shared.pending.remove(&internal_id);
                return Err(ProxyError::NotRunning);
            };
            let write = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            };
            if let Err(e) = write.await {
                self.shared.pending.remove(&internal_id);
                return Err(ProxyError::Transport(e.to_string()));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                // sender dropped: the child died under us
                Err(ProxyError::NotRunning)
            }
            Err(_) => {
                self.shared.pending.remove(&internal_id);
                Err(ProxyError::Timeout)
            }
        }
    }
}

async fn spawn_child(
    command: &str,
    args: &[String],
    shared: &Arc<StdioShared>,
) -> std::io::Result<Child> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    *shared.stdin.lock().await = child.stdin.take();
    shared.running.store(true, Ordering::Release);
    tracing::info!(command = %command, pid = ?child.id(), "stdio backend started");
    Ok(child)
}

/// Pump stdout lines into pending waiters until the stream ends.
async fn run_reader(shared: &Arc<StdioShared>, child: &mut Child) {
    let Some(stdout) = child.stdout.take() else {
        return;
    };
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(mut response) = serde_json::from_str::<JsonRpcResponse>(&line) else {
            tracing::warn!("unparseable line from stdio backend");
            continue;
        };
        let Some(internal_id) = response.id.as_ref().and_then(|v| v.as_u64()) else {
            // server-initiated notification; nothing is waiting on it
            continue;
        };
        if let Some((_, (original_id, tx))) = shared.pending.remove(&internal_id) {
            response.id = original_id;
            let _ = tx.send(response);
        }
    }
}

// ============================================================================
// HTTP PROXY
// ============================================================================

/// Forwards to a base URL, preserving method and id. Timeout bounded by the
/// client configuration.
pub struct HttpProxy {
    url: String,
    client: reqwest::Client,
}

impl HttpProxy {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builds"),
        }
    }

    pub async fn forward(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::Timeout
                } else {
                    ProxyError::Transport(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(ProxyError::Transport(format!("HTTP {}", response.status())));
        }
        response
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))
    }
}

// ============================================================================
// MULTI-SERVER ROUTER
// ============================================================================

/// Routes `tools/call` by a per-tool table, broadcasts `initialize`, and
/// merges `tools/list` across backends. Tool-name collisions resolve in
/// registration order with a warning.
pub struct MultiProxy {
    backends: Vec<(String, Proxy)>,
    routes: HashMap<String, usize>,
}

impl MultiProxy {
    pub fn new(routed: &[RoutedBackend], timeout: Duration) -> Self {
        let mut backends = Vec::new();
        let mut routes: HashMap<String, usize> = HashMap::new();
        for entry in routed {
            let index = backends.len();
            for tool in &entry.tools {
                if let Some(&existing) = routes.get(tool) {
                    let owner: &(String, Proxy) = &backends[existing];
                    tracing::warn!(
                        tool = %tool,
                        kept = %owner.0,
                        ignored = %entry.id,
                        "tool routed to multiple backends, first registration wins"
                    );
                    continue;
                }
                routes.insert(tool.clone(), index);
            }
            backends.push((entry.id.clone(), Proxy::from_spec(&entry.spec, timeout)));
        }
        Self { backends, routes }
    }

    pub fn route_for(&self, tool: &str) -> Option<&str> {
        self.routes
            .get(tool)
            .map(|&i| self.backends[i].0.as_str())
    }

    pub async fn start(&self) {
        for (_, backend) in &self.backends {
            backend.start().await;
        }
    }

    pub async fn stop(&self) {
        for (_, backend) in &self.backends {
            backend.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.backends.iter().all(|(_, b)| b.is_running())
    }

    pub async fn forward(
        &self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        match request.method.as_str() {
            "initialize" => self.broadcast_initialize(request, timeout).await,
            "tools/list" => self.merged_tools_list(request, timeout).await,
            _ => {
                let tool = request
                    .tool_name()
                    .ok_or_else(|| ProxyError::NoRoute("<unnamed>".to_string()))?;
                let index = *self
                    .routes
                    .get(tool)
                    .ok_or_else(|| ProxyError::NoRoute(tool.to_string()))?;
                self.backends[index].1.forward(request, timeout).await
            }
        }
    }

    async fn broadcast_initialize(
        &self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let mut first: Option<JsonRpcResponse> = None;
        for (id, backend) in &self.backends {
            match backend.forward(request, timeout).await {
                Ok(response) => {
                    if first.is_none() {
                        first = Some(response);
                    }
                }
                Err(e) => tracing::warn!(backend = %id, "initialize failed: {e}"),
            }
        }
        first.ok_or(ProxyError::NotRunning)
    }

    async fn merged_tools_list(
        &self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut merged: Vec<Value> = Vec::new();
        for (id, backend) in &self.backends {
            let response = match backend.forward(request, timeout).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(backend = %id, "tools/list failed: {e}");
                    continue;
                }
            };
            let tools = response
                .result
                .as_ref()
                .and_then(|r| r.get("tools"))
                .and_then(|t| t.as_array())
                .cloned()
                .unwrap_or_default();
            for mut tool in tools {
                let Some(name) = tool.get("name").and_then(|n| n.as_str()).map(String::from)
                else {
                    continue;
                };
                if let Some(owner) = seen.get(&name) {
                    tracing::warn!(
                        tool = %name,
                        kept = %owner,
                        ignored = %id,
                        "duplicate tool in tools/list, first backend wins"
                    );
                    continue;
                }
                if let Some(obj) = tool.as_object_mut() {
                    obj.insert("_backend".to_string(), json!(id));
                }
                seen.insert(name, id.clone());
                merged.push(tool);
            }
        }
        Ok(JsonRpcResponse::success(
            request.id.clone(),
            json!({ "tools": merged }),
        ))
    }
}
