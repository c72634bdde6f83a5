/// Usage and audit event records
///
/// Both live in process-wide bounded ring buffers (see `services/usage.rs`
/// and `services/audit.rs`); these are just the shapes.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One metered tool invocation, allowed or denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub api_key: String,
    pub key_name: String,
    pub tool: String,
    pub credits_charged: u64,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One administrative / security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
}
