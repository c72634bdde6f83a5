/// The decision pipeline: ACL → rate limit → quota → credits → spending limit
///
/// Every metered call runs the ordered chain below and short-circuits at the
/// first failure. The credit deduction is the serialization point: locally
/// it is the KeyStore's atomic `try_deduct`; with Redis configured the
/// atomic counter there is authoritative and the local record follows.
///
/// Side effects (audit, usage, metrics, webhooks) are recorded on every
/// outcome and never block the caller beyond a queue push.
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};

use crate::config::PricingConfig;
use crate::middleware::client_ip::ip_matches_any;
use crate::middleware::metrics;
use crate::models::api_key::ApiKeyRecord;
use crate::models::events::UsageEvent;
use crate::models::rpc::{
    JsonRpcRequest, JsonRpcResponse, FORBIDDEN, INVALID_PARAMS, QUOTA_EXCEEDED, RATE_LIMITED,
};
use crate::services::audit::AuditLogger;
use crate::services::hooks::{GroupManager, PluginManager, PluginVerdict, TeamChecker};
use crate::services::key_store::KeyStore;
use crate::services::proxy::{is_permanent_backend_error, Proxy, ProxyError};
use crate::services::quota::QuotaTracker;
use crate::services::rate_limiter::{tool_bucket, RateLimiter};
use crate::services::redis_sync::RedisSync;
use crate::services::usage::UsageMeter;
use crate::services::webhook::WebhookEmitter;

/// Methods that always pass through unmetered.
const BUILTIN_FREE_METHODS: &[&str] = &["initialize", "tools/list", "ping"];

/// Caller identity and transport facts resolved by the front door.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub api_key: Option<String>,
    pub client_ip: Option<IpAddr>,
    /// Tool narrowing carried by a scoped token, if one authenticated.
    pub scoped_tools: Option<Vec<String>>,
}

/// Rate-limit numbers for header injection. When both the global and the
/// per-tool bucket apply, the more specific one is reported.
#[derive(Debug, Clone, Copy)]
pub struct RateMeter {
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_ms: u64,
}

pub struct GateOutcome {
    pub response: JsonRpcResponse,
    pub meter: Option<RateMeter>,
    pub credits_remaining: Option<u64>,
}

impl GateOutcome {
    fn bare(response: JsonRpcResponse) -> Self {
        Self {
            response,
            meter: None,
            credits_remaining: None,
        }
    }
}

pub struct GateSettings {
    pub pricing: PricingConfig,
    pub global_rate_limit: u32,
    pub tool_rate_limits: std::collections::HashMap<String, u32>,
    pub free_methods: Vec<String>,
    pub refund_on_failure: bool,
    pub shadow_mode: bool,
    pub forward_timeout: Duration,
}

pub struct Gate {
    settings: GateSettings,
    key_store: Arc<KeyStore>,
    rate_limiter: Arc<RateLimiter>,
    quota: QuotaTracker,
    proxy: Arc<Proxy>,
    team: Arc<dyn TeamChecker>,
    groups: Arc<dyn GroupManager>,
    plugins: Arc<dyn PluginManager>,
    usage: Arc<UsageMeter>,
    audit: Arc<AuditLogger>,
    webhooks: WebhookEmitter,
    redis: Option<Arc<RedisSync>>,
}

/// Internal result of the admission chain for one tool call.
enum Admission {
    /// Deduction done (or waived in shadow mode); amount actually charged.
    Charged(u64),
    Denied(JsonRpcResponse),
}

impl Gate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: GateSettings,
        key_store: Arc<KeyStore>,
        rate_limiter: Arc<RateLimiter>,
        quota: QuotaTracker,
        proxy: Arc<Proxy>,
        team: Arc<dyn TeamChecker>,
        groups: Arc<dyn GroupManager>,
        plugins: Arc<dyn PluginManager>,
        usage: Arc<UsageMeter>,
        audit: Arc<AuditLogger>,
        webhooks: WebhookEmitter,
        redis: Option<Arc<RedisSync>>,
    ) -> Self {
        Self {
            settings,
            key_store,
            rate_limiter,
            quota,
            proxy,
            team,
            groups,
            plugins,
            usage,
            audit,
            webhooks,
            redis,
        }
    }

    pub fn shadow_mode(&self) -> bool {
        self.settings.shadow_mode
    }

    /// Entry point for every JSON-RPC request that reached the front door.
    pub async fn evaluate(&self, request: JsonRpcRequest, ctx: CallContext) -> GateOutcome {
        self.plugins.execute_on_request(&request.method);

        match request.method.as_str() {
            "tools/call" => self.evaluate_tool_call(request, &ctx).await,
            "tools/call_batch" => self.evaluate_batch(request, &ctx).await,
            _ => self.forward_free(request).await,
        }
    }

    // ------------------------------------------------------------------
    // Free methods
    // ------------------------------------------------------------------

    /// Non-metered methods pass straight through. `tools/list` responses
    /// are enriched with `_pricing` per tool.
    async fn forward_free(&self, request: JsonRpcRequest) -> GateOutcome {
        let is_known_free = BUILTIN_FREE_METHODS.contains(&request.method.as_str())
            || self
                .settings
                .free_methods
                .iter()
                .any(|m| m == &request.method);
        if !is_known_free {
            tracing::debug!(method = %request.method, "forwarding unlisted method unmetered");
        }

        let method = request.method.clone();
        match self
            .proxy
            .forward(&request, self.settings.forward_timeout)
            .await
        {
            Ok(mut response) => {
                if method == "tools/list" {
                    self.enrich_tools_list(&mut response);
                }
                GateOutcome::bare(response)
            }
            Err(e) => GateOutcome::bare(backend_error_response(request.id, &e)),
        }
    }

    fn enrich_tools_list(&self, response: &mut JsonRpcResponse) {
        let Some(tools) = response
            .result
            .as_mut()
            .and_then(|r| r.get_mut("tools"))
            .and_then(|t| t.as_array_mut())
        else {
            return;
        };
        for tool in tools {
            let Some(name) = tool.get("name").and_then(|n| n.as_str()).map(String::from)
            else {
                continue;
            };
            if let Some(obj) = tool.as_object_mut() {
                obj.insert(
                    "_pricing".to_string(),
                    json!({
                        "credits": self.settings.pricing.base_price(&name),
                        "perKb": self.settings.pricing.per_kb_price,
                    }),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Metered single call
    // ------------------------------------------------------------------

    async fn evaluate_tool_call(&self, request: JsonRpcRequest, ctx: &CallContext) -> GateOutcome {
        let started = Instant::now();

        let Some(tool) = request.tool_name().map(String::from) else {
            return GateOutcome::bare(JsonRpcResponse::error(
                request.id,
                INVALID_PARAMS,
                "missing tool name",
            ));
        };

        // steps 2–5: key resolution and key-state checks
        let record = match self.resolve_record(ctx) {
            Ok(record) => record,
            Err(reason) => {
                metrics::record_denial(reason);
                self.usage.record_denial(
                    ctx.api_key.as_deref().unwrap_or("unknown"),
                    "",
                    &tool,
                    reason,
                    elapsed_ms(started),
                    None,
                );
                return GateOutcome::bare(JsonRpcResponse::error(request.id, FORBIDDEN, reason));
            }
        };

        let (request, meter, admission) =
            self.admit(request, &tool, &record, ctx, started).await;

        let charged = match admission {
            Admission::Charged(amount) => amount,
            Admission::Denied(response) => {
                return GateOutcome {
                    response,
                    meter,
                    credits_remaining: self
                        .key_store
                        .get_raw(&record.key)
                        .map(|r| r.credits),
                };
            }
        };

        // step 14: forward, then settle
        let response = self
            .forward_and_settle(request, &tool, &record, charged, started)
            .await;

        // step 15: plugin post-processing
        let response = self.plugins.execute_after_tool_call(&tool, response);

        GateOutcome {
            response,
            meter,
            credits_remaining: self.key_store.get_raw(&record.key).map(|r| r.credits),
        }
    }

    /// Steps 2–5. Returns the live record snapshot or the precise reason.
    fn resolve_record(&self, ctx: &CallContext) -> Result<ApiKeyRecord, &'static str> {
        let Some(key) = ctx.api_key.as_deref() else {
            return Err("invalid_api_key");
        };
        let Some(record) = self.key_store.get_raw(key) else {
            return Err("invalid_api_key");
        };
        if !record.active {
            return Err("invalid_api_key");
        }
        if record.is_expired(Utc::now()) {
            return Err("api_key_expired");
        }
        if record.suspended {
            return Err("key_suspended");
        }
        if !record.ip_allowlist.is_empty() {
            let allowed = ctx
                .client_ip
                .map(|ip| ip_matches_any(ip, &record.ip_allowlist))
                .unwrap_or(false);
            if !allowed {
                return Err("ip_not_allowed");
            }
        }
        Ok(record)
    }

    /// Steps 6–13 for one tool call. In shadow mode every would-be denial is
    /// recorded for observability and the call proceeds uncharged.
    async fn admit(
        &self,
        mut request: JsonRpcRequest,
        tool: &str,
        record: &ApiKeyRecord,
        ctx: &CallContext,
        started: Instant,
    ) -> (JsonRpcRequest, Option<RateMeter>, Admission) {
        let shadow = self.settings.shadow_mode;
        let id = request.id.clone();

        macro_rules! deny {
            ($reason:expr, $response:expr, $meter:expr) => {{
                metrics::record_denial($reason);
                self.usage.record_denial(
                    &record.key,
                    &record.name,
                    tool,
                    $reason,
                    elapsed_ms(started),
                    record.namespace.clone(),
                );
                if shadow {
                    tracing::debug!(tool, reason = %$reason, "shadow mode: denial suppressed");
                } else {
                    self.audit.log(
                        "deny",
                        &record.name,
                        $reason,
                        json!({"tool": tool, "key": record.key}),
                    );
                    return (request, $meter, Admission::Denied($response));
                }
            }};
        }

        // step 6: tool ACL (deny dominates; empty allowed = allow-all;
        // empty post-intersection = deny-all)
        if !self.tool_allowed(tool, record, ctx) {
            deny!(
                "tool_not_allowed",
                JsonRpcResponse::error(id.clone(), FORBIDDEN, "tool_not_allowed"),
                None
            );
        }

        // step 7: plugins may rewrite params or answer outright
        match self
            .plugins
            .execute_before_tool_call(tool, request.params.as_ref())
        {
            PluginVerdict::Continue(None) => {}
            PluginVerdict::Continue(Some(params)) => request.params = Some(params),
            PluginVerdict::ShortCircuit(response) => {
                return (request, None, Admission::Denied(response));
            }
        }

        // step 8: rate limits, global then per-tool; headers carry the more
        // specific bucket when both apply
        let mut meter = None;
        if self.settings.global_rate_limit > 0 {
            let decision = self
                .rate_limiter
                .check(&record.key, self.settings.global_rate_limit);
            meter = Some(RateMeter {
                limit: self.settings.global_rate_limit,
                remaining: decision.remaining,
                reset_in_ms: decision.reset_in_ms,
            });
            if !decision.allowed {
                metrics::record_rate_limit_hit(tool);
                deny!(
                    "rate_limited",
                    JsonRpcResponse::error(id.clone(), RATE_LIMITED, "rate_limited"),
                    meter
                );
            }
        }
        if let Some(&limit) = self.settings.tool_rate_limits.get(tool) {
            let decision = self.rate_limiter.check(&tool_bucket(&record.key, tool), limit);
            meter = Some(RateMeter {
                limit,
                remaining: decision.remaining,
                reset_in_ms: decision.reset_in_ms,
            });
            if !decision.allowed {
                metrics::record_rate_limit_hit(tool);
                deny!(
                    "rate_limited",
                    JsonRpcResponse::error(id.clone(), RATE_LIMITED, "rate_limited"),
                    meter
                );
            }
        }

        // step 11 computation happens here because the team and quota checks
        // both take the prospective charge
        let base_price = self
            .settings
            .pricing
            .price_for(tool, request.argument_bytes());
        let credits_required = self.plugins.transform_price(tool, base_price);

        // step 9: external team / group budget
        let team_decision = self.team.check(&record.key, credits_required);
        if !team_decision.allowed {
            let reason = team_decision
                .reason
                .unwrap_or_else(|| "team_budget_exhausted".to_string());
            deny!(
                &reason,
                JsonRpcResponse::error(id.clone(), FORBIDDEN, reason.clone()),
                meter
            );
        }

        // step 10: quota
        let quota_check = self
            .key_store
            .with_record_mut(&record.key, |r| {
                self.quota.check(r, credits_required, Utc::now())
            })
            .unwrap_or(Ok(()));
        if let Err(denial) = quota_check {
            deny!(
                denial.as_str(),
                JsonRpcResponse::error(id.clone(), QUOTA_EXCEEDED, denial.as_str()),
                meter
            );
        }

        // step 12: spending limit
        if record.spending_limit > 0
            && record.total_spent + credits_required > record.spending_limit
        {
            deny!(
                "spending_limit_exceeded",
                JsonRpcResponse::error(id.clone(), FORBIDDEN, "spending_limit_exceeded"),
                meter
            );
        }

        if shadow {
            // decisions recorded above; nothing is charged
            return (request, meter, Admission::Charged(0));
        }

        // step 13: auto-topup, then the serialized deduction
        self.key_store.maybe_auto_topup(&record.key, credits_required);

        let deducted = match &self.redis {
            Some(redis) => match redis.try_deduct(&record.key, credits_required).await {
                Some(outcome) => {
                    if outcome {
                        // the distributed counter is authoritative; the local
                        // record follows it
                        self.key_store.with_record_mut(&record.key, |r| {
                            let before = r.credits;
                            r.credits = r.credits.saturating_sub(credits_required);
                            r.total_spent += credits_required;
                            r.total_calls += 1;
                            r.last_used_at = Some(Utc::now());
                            r.push_ledger(
                                crate::models::api_key::LedgerEntryType::Charge,
                                credits_required,
                                before,
                                r.credits,
                                None,
                            );
                        });
                    }
                    outcome
                }
                None => self.key_store.try_deduct(&record.key, credits_required),
            },
            None => self.key_store.try_deduct(&record.key, credits_required),
        };

        if !deducted {
            let available = self
                .key_store
                .get_raw(&record.key)
                .map(|r| r.credits)
                .unwrap_or(0);
            metrics::record_denial("insufficient_credits");
            self.usage.record_denial(
                &record.key,
                &record.name,
                tool,
                "insufficient_credits",
                elapsed_ms(started),
                record.namespace.clone(),
            );
            self.audit.log(
                "deny",
                &record.name,
                "insufficient_credits",
                json!({"tool": tool, "key": record.key, "required": credits_required, "available": available}),
            );
            let response = JsonRpcResponse::payment_required(
                id,
                tool,
                credits_required,
                available,
                json!({
                    "base": self.settings.pricing.base_price(tool),
                    "perKb": self.settings.pricing.per_kb_price,
                }),
            );
            return (request, meter, Admission::Denied(response));
        }

        (request, meter, Admission::Charged(credits_required))
    }

    /// Steps 14 and 16: forward to the backend and settle credits, quota,
    /// usage, metrics, audit and webhooks according to the outcome.
    async fn forward_and_settle(
        &self,
        request: JsonRpcRequest,
        tool: &str,
        record: &ApiKeyRecord,
        charged: u64,
        started: Instant,
    ) -> JsonRpcResponse {
        let forwarded = self
            .proxy
            .forward(&request, self.settings.forward_timeout)
            .await;
        let duration_ms = elapsed_ms(started);

        let response = match forwarded {
            Ok(response) => response,
            Err(e) => {
                self.settle_failure(tool, record, charged, duration_ms, &e.to_string())
                    .await;
                return backend_error_response(request.id, &e);
            }
        };

        if response.is_error() && !is_permanent_backend_error(&response) {
            // transient backend error: refundable
            self.settle_failure(
                tool,
                record,
                charged,
                duration_ms,
                &format!("backend code {}", response.error_code().unwrap_or(0)),
            )
            .await;
            return response;
        }

        // success (or permanent error, which stays charged)
        if charged > 0 {
            self.key_store.with_record_mut(&record.key, |r| {
                self.quota.record(r, charged, Utc::now());
            });
            self.team.record(&record.key, charged);
        }
        metrics::record_tool_call(tool, if response.is_error() { "error" } else { "ok" });
        metrics::record_credits_charged(tool, charged);
        self.usage.record(UsageEvent {
            timestamp: Utc::now(),
            api_key: record.key.clone(),
            key_name: record.name.clone(),
            tool: tool.to_string(),
            credits_charged: charged,
            allowed: true,
            deny_reason: None,
            duration_ms,
            namespace: record.namespace.clone(),
        });
        self.audit.log(
            "tool_call",
            &record.name,
            tool,
            json!({"credits": charged, "key": record.key}),
        );
        self.webhooks.emit(
            "tool_call",
            &record.name,
            json!({"tool": tool, "credits": charged}),
        );
        response
    }

    /// Backend failure bookkeeping: refund when configured, quota untouched.
    async fn settle_failure(
        &self,
        tool: &str,
        record: &ApiKeyRecord,
        charged: u64,
        duration_ms: u64,
        detail: &str,
    ) {
        metrics::record_tool_call(tool, "error");
        if charged > 0 && self.settings.refund_on_failure {
            self.key_store
                .refund(&record.key, charged, Some("backend_error".to_string()));
            if let Some(redis) = &self.redis {
                redis.refund(&record.key, charged).await;
            }
            metrics::record_refund(tool);
        }
        self.usage.record(UsageEvent {
            timestamp: Utc::now(),
            api_key: record.key.clone(),
            key_name: record.name.clone(),
            tool: tool.to_string(),
            credits_charged: if self.settings.refund_on_failure { 0 } else { charged },
            allowed: false,
            deny_reason: Some("backend_error".to_string()),
            duration_ms,
            namespace: record.namespace.clone(),
        });
        self.audit.log(
            "backend_error",
            &record.name,
            detail,
            json!({"tool": tool, "refunded": charged > 0 && self.settings.refund_on_failure}),
        );
    }

    /// Allowlist intersection: every present allow-list must contain the
    /// tool; any deny-list containing it dominates. An empty record
    /// allow-list imposes nothing; an empty intersection denies everything.
    fn tool_allowed(&self, tool: &str, record: &ApiKeyRecord, ctx: &CallContext) -> bool {
        let group_denied = self.groups.denied_for(record);
        if record.denied_tools.iter().any(|t| t == tool)
            || group_denied.iter().any(|t| t == tool)
        {
            return false;
        }

        if !record.allowed_tools.is_empty() && !record.allowed_tools.iter().any(|t| t == tool) {
            return false;
        }
        if let Some(scoped) = &ctx.scoped_tools {
            if !scoped.iter().any(|t| t == tool) {
                return false;
            }
        }
        if let Some(group_allowed) = self.groups.allowed_for(record) {
            if !group_allowed.iter().any(|t| t == tool) {
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Batch
    // ------------------------------------------------------------------

    /// `tools/call_batch`: key-state checks run once, then each sub-call
    /// runs the per-tool pipeline independently. The aggregate carries the
    /// per-sub-call outcomes and the total actually charged.
    async fn evaluate_batch(&self, request: JsonRpcRequest, ctx: &CallContext) -> GateOutcome {
        let started = Instant::now();
        let id = request.id.clone();

        let calls: Vec<Value> = match request
            .params
            .as_ref()
            .and_then(|p| p.get("calls"))
            .and_then(|c| c.as_array())
        {
            Some(calls) if !calls.is_empty() => calls.clone(),
            _ => {
                return GateOutcome::bare(JsonRpcResponse::error(
                    id,
                    INVALID_PARAMS,
                    "calls array required",
                ));
            }
        };

        let record = match self.resolve_record(ctx) {
            Ok(record) => record,
            Err(reason) => {
                metrics::record_denial(reason);
                return GateOutcome::bare(JsonRpcResponse::error(id, FORBIDDEN, reason));
            }
        };

        let mut results = Vec::with_capacity(calls.len());
        let mut total_charged: u64 = 0;
        let mut last_meter = None;

        for (index, call) in calls.into_iter().enumerate() {
            let sub_request = JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                id: Some(json!(index)),
                method: "tools/call".to_string(),
                params: Some(call),
            };
            let Some(tool) = sub_request.tool_name().map(String::from) else {
                results.push(json!({
                    "index": index,
                    "error": {"code": INVALID_PARAMS, "message": "missing tool name"},
                }));
                continue;
            };

            // earlier sub-calls move the counters; check against live state
            let record = self
                .key_store
                .get_raw(&record.key)
                .unwrap_or_else(|| record.clone());

            let (sub_request, meter, admission) = self
                .admit(sub_request, &tool, &record, ctx, started)
                .await;
            if meter.is_some() {
                last_meter = meter;
            }

            let response = match admission {
                Admission::Charged(charged) => {
                    let response = self
                        .forward_and_settle(sub_request, &tool, &record, charged, started)
                        .await;
                    // a sub-call counts as charged unless its failure was
                    // refunded (transport or transient backend error)
                    let refunded = response.is_error()
                        && !is_permanent_backend_error(&response)
                        && self.settings.refund_on_failure;
                    if !refunded {
                        total_charged += charged;
                    }
                    self.plugins.execute_after_tool_call(&tool, response)
                }
                Admission::Denied(response) => response,
            };

            results.push(json!({
                "index": index,
                "tool": tool,
                "result": response.result,
                "error": response.error,
            }));
        }

        GateOutcome {
            response: JsonRpcResponse::success(
                id,
                json!({"results": results, "totalCreditsCharged": total_charged}),
            ),
            meter: last_meter,
            credits_remaining: self.key_store.get_raw(&record.key).map(|r| r.credits),
        }
    }
}

fn backend_error_response(id: Option<Value>, error: &ProxyError) -> JsonRpcResponse {
    JsonRpcResponse::error_with_data(
        id,
        -32000,
        "backend_error",
        json!({"detail": error.to_string()}),
    )
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
