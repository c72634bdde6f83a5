/// Collaborator contracts consumed by the Gate
///
/// Team budgets, group ACLs and plugins live outside the core; the Gate
/// talks to them through these traits. Defaults are permissive no-ops so a
/// bare gateway runs without any of them wired.
use serde_json::Value;

use crate::models::api_key::ApiKeyRecord;
use crate::models::rpc::JsonRpcResponse;

#[derive(Debug, Clone)]
pub struct TeamDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl TeamDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Team / tenant budget check, consulted before the credit deduction, and
/// the matching recorder called after a successful charge.
pub trait TeamChecker: Send + Sync {
    fn check(&self, api_key: &str, credits: u64) -> TeamDecision;
    fn record(&self, _api_key: &str, _credits: u64) {}
}

/// Group-level ACL contribution. `allowed_for` returning `None` means the
/// group imposes no allow-list; an empty denied list is the default.
pub trait GroupManager: Send + Sync {
    fn allowed_for(&self, _record: &ApiKeyRecord) -> Option<Vec<String>> {
        None
    }
    fn denied_for(&self, _record: &ApiKeyRecord) -> Vec<String> {
        Vec::new()
    }
}

/// What a `before_tool_call` plugin decided.
pub enum PluginVerdict {
    /// Proceed, possibly with rewritten params.
    Continue(Option<Value>),
    /// Skip the backend entirely and answer with this response.
    ShortCircuit(JsonRpcResponse),
}

pub trait PluginManager: Send + Sync {
    fn execute_start(&self) {}
    fn execute_stop(&self) {}
    fn execute_on_request(&self, _method: &str) {}

    fn execute_before_tool_call(&self, _tool: &str, _params: Option<&Value>) -> PluginVerdict {
        PluginVerdict::Continue(None)
    }

    fn execute_after_tool_call(&self, _tool: &str, response: JsonRpcResponse) -> JsonRpcResponse {
        response
    }

    /// Last word on the computed price.
    fn transform_price(&self, _tool: &str, price: u64) -> u64 {
        price
    }
}

pub struct NoopTeamChecker;

impl TeamChecker for NoopTeamChecker {
    fn check(&self, _api_key: &str, _credits: u64) -> TeamDecision {
        TeamDecision::allow()
    }
}

pub struct NoopGroupManager;

impl GroupManager for NoopGroupManager {}

pub struct NoopPluginManager;

impl PluginManager for NoopPluginManager {}
