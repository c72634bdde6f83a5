/// API key records: identity + policy + counters for one caller
///
/// The `ApiKeyRecord` is the unit the whole gateway meters against. The
/// KeyStore exclusively owns the live map of these; everything else holds a
/// reference through the store.
use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Notes are capped per key to bound snapshot growth.
pub const MAX_NOTES_PER_KEY: usize = 50;
/// Tags are capped per key to bound snapshot growth.
pub const MAX_TAGS_PER_KEY: usize = 50;
/// Per-key credit ledger history bound.
pub const MAX_LEDGER_ENTRIES: usize = 200;

/// Quota limits; 0 means "no limit" for that dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    #[serde(default)]
    pub daily_calls: u64,
    #[serde(default)]
    pub monthly_calls: u64,
    #[serde(default)]
    pub daily_credits: u64,
    #[serde(default)]
    pub monthly_credits: u64,
}

impl QuotaConfig {
    pub fn is_unlimited(&self) -> bool {
        self.daily_calls == 0
            && self.monthly_calls == 0
            && self.daily_credits == 0
            && self.monthly_credits == 0
    }
}

/// Auto top-up policy: when credits drop below `threshold`, add `amount`,
/// at most `max_daily` times per UTC day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTopupConfig {
    pub threshold: u64,
    pub amount: u64,
    #[serde(default)]
    pub max_daily: u32,
    #[serde(default)]
    pub per_day_charged: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_charge_day: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Initial,
    Topup,
    AutoTopup,
    Charge,
    Refund,
    TransferIn,
    TransferOut,
}

/// One credit movement on a key. `balance_before`/`balance_after` make the
/// ledger self-checking without replaying it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,
    pub amount: u64,
    pub balance_before: u64,
    pub balance_after: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    /// Immutable opaque identifier, `pg_` prefixed, high entropy.
    pub key: String,
    /// Optional globally-unique human handle. Mutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,

    /// Non-negative live balance. Only the store mutates this.
    pub credits: u64,
    #[serde(default)]
    pub total_spent: u64,
    #[serde(default)]
    pub total_calls: u64,
    /// 0 = unlimited; otherwise the cap on `total_spent`.
    #[serde(default)]
    pub spending_limit: u64,

    /// Empty = allow all. Deny dominates.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Exact IPs or CIDRs; empty = any.
    #[serde(default)]
    pub ip_allowlist: Vec<String>,

    /// Per-key override of the global quota config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaConfig>,
    #[serde(default)]
    pub quota_daily_calls: u64,
    #[serde(default)]
    pub quota_monthly_calls: u64,
    #[serde(default)]
    pub quota_daily_credits: u64,
    #[serde(default)]
    pub quota_monthly_credits: u64,
    /// `YYYY-MM-DD` marker for the daily counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_last_reset_day: Option<String>,
    /// `YYYY-MM` marker for the monthly counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_last_reset_month: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_topup: Option<AutoTopupConfig>,

    /// Reaching this instant makes the key invalid but not revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Blocks use without invalidating.
    #[serde(default)]
    pub suspended: bool,
    /// false = revoked, permanent.
    pub active: bool,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<String>,

    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
}

impl ApiKeyRecord {
    pub fn new(name: impl Into<String>, credits: u64) -> Self {
        let now = Utc::now();
        let mut record = Self {
            key: generate_key(),
            alias: None,
            name: name.into(),
            namespace: None,
            group: None,
            tags: Vec::new(),
            credits,
            total_spent: 0,
            total_calls: 0,
            spending_limit: 0,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            ip_allowlist: Vec::new(),
            quota: None,
            quota_daily_calls: 0,
            quota_monthly_calls: 0,
            quota_daily_credits: 0,
            quota_monthly_credits: 0,
            quota_last_reset_day: None,
            quota_last_reset_month: None,
            auto_topup: None,
            expires_at: None,
            suspended: false,
            active: true,
            created_at: now,
            last_used_at: None,
            notes: Vec::new(),
            ledger: Vec::new(),
        };
        if credits > 0 {
            record.push_ledger(LedgerEntryType::Initial, credits, 0, credits, None);
        }
        record
    }

    /// A key is usable iff active, not suspended, and not past expiry.
    /// A call at exactly `expires_at` is denied.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.suspended && !self.is_expired(now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }

    /// Append a ledger entry, truncating the oldest past the history bound.
    pub fn push_ledger(
        &mut self,
        entry_type: LedgerEntryType,
        amount: u64,
        balance_before: u64,
        balance_after: u64,
        memo: Option<String>,
    ) {
        self.ledger.push(LedgerEntry {
            timestamp: Utc::now(),
            entry_type,
            amount,
            balance_before,
            balance_after,
            memo,
        });
        if self.ledger.len() > MAX_LEDGER_ENTRIES {
            let excess = self.ledger.len() - MAX_LEDGER_ENTRIES;
            self.ledger.drain(..excess);
        }
    }

    /// Effective quota for this record given the global default.
    pub fn effective_quota(&self, global: Option<&QuotaConfig>) -> Option<QuotaConfig> {
        self.quota.or_else(|| global.copied())
    }
}

/// Generate a fresh `pg_` key: 32 chars of high-entropy base62.
pub fn generate_key() -> String {
    format!("pg_{}", random_base62(32))
}

/// Generate an `mcp_sess_` session id.
pub fn generate_session_id() -> String {
    format!("mcp_sess_{}", random_base62(24))
}

fn random_base62(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Current UTC day marker, `YYYY-MM-DD`.
pub fn utc_day(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Current UTC month marker, `YYYY-MM`.
pub fn utc_month(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_generated_keys_unique_and_prefixed() {
        let a = generate_key();
        let b = generate_key();
        assert!(a.starts_with("pg_"));
        assert!(a.len() >= 20);
        assert_ne!(a, b);
    }

    #[test]
    fn test_usable_lifecycle() {
        let now = Utc::now();
        let mut record = ApiKeyRecord::new("test", 10);
        assert!(record.is_usable(now));

        record.suspended = true;
        assert!(!record.is_usable(now));
        record.suspended = false;

        record.active = false;
        assert!(!record.is_usable(now));
        record.active = true;

        record.expires_at = Some(now + Duration::hours(1));
        assert!(record.is_usable(now));
    }

    #[test]
    fn test_expiry_boundary_is_denied() {
        let now = Utc::now();
        let mut record = ApiKeyRecord::new("test", 0);
        record.expires_at = Some(now);
        // exactly at expiresAt counts as expired
        assert!(record.is_expired(now));
        assert!(!record.is_usable(now));
    }

    #[test]
    fn test_initial_ledger_entry() {
        let record = ApiKeyRecord::new("funded", 100);
        assert_eq!(record.ledger.len(), 1);
        let entry = &record.ledger[0];
        assert_eq!(entry.entry_type, LedgerEntryType::Initial);
        assert_eq!(entry.balance_before, 0);
        assert_eq!(entry.balance_after, 100);
    }

    #[test]
    fn test_ledger_bounded() {
        let mut record = ApiKeyRecord::new("test", 0);
        for i in 0..(MAX_LEDGER_ENTRIES + 50) {
            record.push_ledger(LedgerEntryType::Charge, 1, i as u64, i as u64, None);
        }
        assert_eq!(record.ledger.len(), MAX_LEDGER_ENTRIES);
    }

    #[test]
    fn test_effective_quota_prefers_override() {
        let mut record = ApiKeyRecord::new("test", 0);
        let global = QuotaConfig {
            daily_calls: 100,
            ..Default::default()
        };
        assert_eq!(
            record.effective_quota(Some(&global)).unwrap().daily_calls,
            100
        );

        record.quota = Some(QuotaConfig {
            daily_calls: 5,
            ..Default::default()
        });
        assert_eq!(record.effective_quota(Some(&global)).unwrap().daily_calls, 5);
    }

    #[test]
    fn test_snapshot_roundtrip_is_stable() {
        let mut record = ApiKeyRecord::new("roundtrip", 42);
        record.alias = Some("ci-bot".to_string());
        record.allowed_tools = vec!["search".to_string()];
        let json = serde_json::to_string(&record).unwrap();
        let back: ApiKeyRecord = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&back).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn test_utc_markers() {
        let ts = DateTime::parse_from_rfc3339("2026-03-09T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(utc_day(ts), "2026-03-09");
        assert_eq!(utc_month(ts), "2026-03");
    }
}
