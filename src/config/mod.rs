use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::models::api_key::QuotaConfig;

/// Where tool calls are forwarded to: a spawned child process speaking
/// newline-delimited JSON-RPC, or an HTTP MCP server.
#[derive(Debug, Clone)]
pub enum BackendSpec {
    Stdio { command: String, args: Vec<String> },
    Http { url: String },
}

impl BackendSpec {
    /// Parse `stdio:cmd arg…` or `http:URL`.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(rest) = raw.strip_prefix("stdio:") {
            let mut parts = rest.split_whitespace().map(|s| s.to_string());
            let command = parts.next().context("empty stdio backend command")?;
            Ok(BackendSpec::Stdio {
                command,
                args: parts.collect(),
            })
        } else if let Some(rest) = raw.strip_prefix("http:") {
            // `http:http://…` and bare `http://…` are both accepted
            let url = if rest.starts_with("//") {
                format!("http:{}", rest)
            } else {
                rest.to_string()
            };
            Ok(BackendSpec::Http { url })
        } else {
            bail!("backend spec must start with 'stdio:' or 'http:': {raw}")
        }
    }
}

/// One entry of the multi-server routing table.
#[derive(Debug, Clone)]
pub struct RoutedBackend {
    pub id: String,
    pub spec: BackendSpec,
    /// Tools this backend serves; used to build the tool → backend table.
    pub tools: Vec<String>,
}

/// Credit pricing: `base + ceil(argument_bytes / 1024) * per_kb`.
#[derive(Debug, Clone, Default)]
pub struct PricingConfig {
    pub default_price: u64,
    pub per_kb_price: u64,
    pub tool_prices: HashMap<String, u64>,
}

impl PricingConfig {
    pub fn base_price(&self, tool: &str) -> u64 {
        self.tool_prices.get(tool).copied().unwrap_or(self.default_price)
    }

    pub fn price_for(&self, tool: &str, argument_bytes: usize) -> u64 {
        let kb = (argument_bytes as u64).div_ceil(1024);
        self.base_price(tool) + kb * self.per_kb_price
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,

    /// Single-backend mode. Mutually exclusive with `backends`.
    pub backend: Option<BackendSpec>,
    /// Multi-server routing mode.
    pub backends: Vec<RoutedBackend>,
    pub forward_timeout: Duration,

    pub pricing: PricingConfig,

    /// Per-minute global limit per key; 0 disables.
    pub global_rate_limit: u32,
    /// Per-minute per-tool limits, keyed by tool name.
    pub tool_rate_limits: HashMap<String, u32>,

    /// Methods forwarded with no auth and no metering, beyond the built-ins.
    pub free_methods: Vec<String>,
    pub refund_on_failure: bool,
    pub shadow_mode: bool,

    pub global_quota: Option<QuotaConfig>,

    pub session_timeout: Duration,
    pub max_sessions: usize,
    pub max_sse_per_session: usize,

    pub snapshot_path: PathBuf,
    pub snapshot_flush_interval: Duration,

    pub redis_url: Option<String>,
    /// HMAC secret for scoped tokens. Generated (and warned about) if unset.
    pub token_secret: String,

    pub trusted_proxies: Vec<String>,
    pub cors_origins: Vec<String>,
    pub max_body_bytes: usize,
    /// Operator-configured extra response headers, validated at startup.
    pub custom_headers: Vec<(String, String)>,

    pub webhook_url: Option<String>,
    pub drain_deadline: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let backend = match env::var("PAYGATE_BACKEND") {
            Ok(raw) if !raw.trim().is_empty() => Some(BackendSpec::parse(raw.trim())?),
            _ => None,
        };

        let backends = match env::var("PAYGATE_BACKENDS") {
            Ok(raw) if !raw.trim().is_empty() => parse_backends_json(&raw)?,
            _ => Vec::new(),
        };

        if backend.is_some() && !backends.is_empty() {
            bail!("PAYGATE_BACKEND and PAYGATE_BACKENDS are mutually exclusive");
        }

        let token_secret = match env::var("PAYGATE_TOKEN_SECRET") {
            Ok(secret) if secret.len() >= 16 => secret,
            Ok(_) => bail!("PAYGATE_TOKEN_SECRET must be at least 16 characters"),
            Err(_) => {
                let generated = crate::models::api_key::generate_key();
                tracing::warn!(
                    "⚠️  PAYGATE_TOKEN_SECRET not set - generated an ephemeral secret. \
                     Scoped tokens will not survive a restart."
                );
                generated
            }
        };

        let global_quota = {
            let quota = QuotaConfig {
                daily_calls: env_u64("PAYGATE_QUOTA_DAILY_CALLS", 0),
                monthly_calls: env_u64("PAYGATE_QUOTA_MONTHLY_CALLS", 0),
                daily_credits: env_u64("PAYGATE_QUOTA_DAILY_CREDITS", 0),
                monthly_credits: env_u64("PAYGATE_QUOTA_MONTHLY_CREDITS", 0),
            };
            if quota.is_unlimited() {
                None
            } else {
                Some(quota)
            }
        };

        let custom_headers = match env::var("PAYGATE_CUSTOM_HEADERS") {
            Ok(raw) if !raw.trim().is_empty() => parse_custom_headers(&raw)?,
            _ => Vec::new(),
        };

        Ok(Self {
            host: env::var("PAYGATE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_u64("PAYGATE_PORT", 8402) as u16,
            backend,
            backends,
            forward_timeout: Duration::from_secs(env_u64("PAYGATE_FORWARD_TIMEOUT_SECS", 30)),
            pricing: PricingConfig {
                default_price: env_u64("PAYGATE_DEFAULT_PRICE", 1),
                per_kb_price: env_u64("PAYGATE_PER_KB_PRICE", 0),
                tool_prices: parse_u64_map(&env::var("PAYGATE_TOOL_PRICES").unwrap_or_default())?,
            },
            global_rate_limit: env_u64("PAYGATE_GLOBAL_RATE_LIMIT", 0) as u32,
            tool_rate_limits: parse_u64_map(
                &env::var("PAYGATE_TOOL_RATE_LIMITS").unwrap_or_default(),
            )?
            .into_iter()
            .map(|(k, v)| (k, v as u32))
            .collect(),
            free_methods: env_csv("PAYGATE_FREE_METHODS"),
            refund_on_failure: env_bool("PAYGATE_REFUND_ON_FAILURE", true),
            shadow_mode: env_bool("PAYGATE_SHADOW_MODE", false),
            global_quota,
            session_timeout: Duration::from_secs(env_u64("PAYGATE_SESSION_TIMEOUT_SECS", 300)),
            max_sessions: env_u64("PAYGATE_MAX_SESSIONS", 1000) as usize,
            max_sse_per_session: env_u64("PAYGATE_MAX_SSE_PER_SESSION", 8) as usize,
            snapshot_path: PathBuf::from(
                env::var("PAYGATE_SNAPSHOT_PATH").unwrap_or_else(|_| "./data/keys.json".into()),
            ),
            snapshot_flush_interval: Duration::from_secs(env_u64(
                "PAYGATE_SNAPSHOT_FLUSH_SECS",
                5,
            )),
            redis_url: env::var("PAYGATE_REDIS_URL").ok().filter(|s| !s.is_empty()),
            token_secret,
            trusted_proxies: env_csv("PAYGATE_TRUSTED_PROXIES"),
            cors_origins: env_csv("PAYGATE_CORS_ORIGINS"),
            max_body_bytes: env_u64("PAYGATE_MAX_BODY_BYTES", 1024 * 1024) as usize,
            custom_headers,
            webhook_url: env::var("PAYGATE_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            drain_deadline: Duration::from_secs(env_u64("PAYGATE_DRAIN_DEADLINE_SECS", 10)),
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_csv(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `{"tool": 5, …}` maps used for prices and per-tool rate limits.
fn parse_u64_map(raw: &str) -> Result<HashMap<String, u64>> {
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(raw).context("expected a JSON object of name → integer")
}

/// `PAYGATE_BACKENDS` JSON: `[{"id":"a","backend":"http:…","tools":["x"]}]`.
fn parse_backends_json(raw: &str) -> Result<Vec<RoutedBackend>> {
    #[derive(serde::Deserialize)]
    struct Entry {
        id: String,
        backend: String,
        #[serde(default)]
        tools: Vec<String>,
    }
    let entries: Vec<Entry> = serde_json::from_str(raw).context("invalid PAYGATE_BACKENDS JSON")?;
    entries
        .into_iter()
        .map(|e| {
            Ok(RoutedBackend {
                spec: BackendSpec::parse(&e.backend)?,
                id: e.id,
                tools: e.tools,
            })
        })
        .collect()
}

/// Operator headers, `Name: value` pairs separated by `;`. Names must not
/// contain spaces or tabs, values must not contain CR/LF, values ≤ 8 KiB.
fn parse_custom_headers(raw: &str) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for pair in raw.split(';').filter(|s| !s.trim().is_empty()) {
        let (name, value) = pair
            .split_once(':')
            .with_context(|| format!("custom header missing ':': {pair}"))?;
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.is_empty() || name.contains(' ') || name.contains('\t') {
            bail!("invalid custom header name: {name:?}");
        }
        if value.contains('\r') || value.contains('\n') {
            bail!("custom header value contains CR/LF: {name}");
        }
        if value.len() > 8 * 1024 {
            bail!("custom header value exceeds 8 KiB: {name}");
        }
        headers.push((name, value));
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_spec_parse() {
        match BackendSpec::parse("stdio:node server.js --flag").unwrap() {
            BackendSpec::Stdio { command, args } => {
                assert_eq!(command, "node");
                assert_eq!(args, vec!["server.js", "--flag"]);
            }
            _ => panic!("expected stdio"),
        }

        match BackendSpec::parse("http://localhost:9000/mcp").unwrap() {
            BackendSpec::Http { url } => assert_eq!(url, "http://localhost:9000/mcp"),
            _ => panic!("expected http"),
        }

        assert!(BackendSpec::parse("ftp:whatever").is_err());
    }

    #[test]
    fn test_pricing_per_kb_rounds_up() {
        let pricing = PricingConfig {
            default_price: 2,
            per_kb_price: 1,
            tool_prices: HashMap::from([("expensive".to_string(), 10)]),
        };
        assert_eq!(pricing.price_for("anything", 0), 2);
        assert_eq!(pricing.price_for("anything", 1), 3);
        assert_eq!(pricing.price_for("anything", 1024), 3);
        assert_eq!(pricing.price_for("anything", 1025), 4);
        assert_eq!(pricing.price_for("expensive", 0), 10);
    }

    #[test]
    fn test_custom_header_validation() {
        let ok = parse_custom_headers("X-Env: prod; X-Zone: eu-1").unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[0], ("X-Env".to_string(), "prod".to_string()));

        assert!(parse_custom_headers("Bad Name: x").is_err());
        assert!(parse_custom_headers("X-Bad: a\r\nb").is_err());
        let long = format!("X-Long: {}", "v".repeat(9 * 1024));
        assert!(parse_custom_headers(&long).is_err());
    }

    #[test]
    fn test_parse_backends_json() {
        let raw = r#"[{"id":"search","backend":"http://127.0.0.1:9001/mcp","tools":["web_search"]}]"#;
        let routed = parse_backends_json(raw).unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].id, "search");
        assert_eq!(routed[0].tools, vec!["web_search"]);
    }
}
