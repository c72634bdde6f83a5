/// In-memory API key store with secondary indexes and snapshot persistence
///
/// The store exclusively owns the live `ApiKeyRecord` map. Every mutation
/// that touches an index (alias, namespace, group) goes through the store so
/// both sides stay in lockstep. Credit decrements in the local path happen
/// only through `try_deduct`, whose per-entry exclusive access makes the
/// check-and-deduct a single indivisible step.
///
/// Persistence is a single JSON snapshot: mutations mark a dirty flag, a
/// timer flushes, and the file is atomically replaced (write-tmp + rename).
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::api_key::{
    generate_key, utc_day, ApiKeyRecord, AutoTopupConfig, LedgerEntryType, QuotaConfig,
    MAX_NOTES_PER_KEY, MAX_TAGS_PER_KEY,
};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key not found")]
    NotFound,
    #[error("alias already in use: {0}")]
    AliasTaken(String),
    #[error("key is revoked")]
    Revoked,
    #[error("snapshot I/O failed: {0}")]
    Snapshot(#[from] std::io::Error),
    #[error("snapshot parse failed: {0}")]
    SnapshotFormat(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;

/// Everything an admin can set at creation time.
#[derive(Debug, Clone, Default)]
pub struct CreateKeyOptions {
    pub name: String,
    pub credits: u64,
    pub alias: Option<String>,
    pub namespace: Option<String>,
    pub group: Option<String>,
    pub tags: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,
    pub ip_allowlist: Vec<String>,
    pub quota: Option<QuotaConfig>,
    pub spending_limit: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub auto_topup: Option<AutoTopupConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    Credits,
    TotalSpent,
    Name,
}

#[derive(Debug, Clone)]
pub struct ListFilter {
    pub namespace: Option<String>,
    pub group: Option<String>,
    pub tag: Option<String>,
    pub active_only: bool,
    pub offset: usize,
    pub limit: usize,
    pub sort: SortField,
    pub descending: bool,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            namespace: None,
            group: None,
            tag: None,
            active_only: false,
            offset: 0,
            limit: 100,
            sort: SortField::CreatedAt,
            descending: true,
        }
    }
}

/// On-disk layout, shared by save/load/export/import.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub keys: Vec<ApiKeyRecord>,
    pub aliases: HashMap<String, String>,
}

type TopupHook = Box<dyn Fn(&str, u64) + Send + Sync>;

pub struct KeyStore {
    records: DashMap<String, ApiKeyRecord>,
    /// alias → key. Guarded separately; every alias mutation takes this lock
    /// before touching the record so the two maps never diverge.
    aliases: Mutex<HashMap<String, String>>,
    namespaces: Mutex<HashMap<String, HashSet<String>>>,
    groups: Mutex<HashMap<String, HashSet<String>>>,
    snapshot_path: PathBuf,
    dirty: AtomicBool,
    /// Fired after an auto top-up lands; set once at wiring time.
    topup_hook: RwLock<Option<TopupHook>>,
}

impl KeyStore {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            records: DashMap::new(),
            aliases: Mutex::new(HashMap::new()),
            namespaces: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            snapshot_path: snapshot_path.into(),
            dirty: AtomicBool::new(false),
            topup_hook: RwLock::new(None),
        }
    }

    pub fn set_topup_hook(&self, hook: impl Fn(&str, u64) + Send + Sync + 'static) {
        *self.topup_hook.write().unwrap() = Some(Box::new(hook));
    }

    // ------------------------------------------------------------------
    // Creation / lookup
    // ------------------------------------------------------------------

    pub fn create(&self, options: CreateKeyOptions) -> Result<ApiKeyRecord> {
        let mut record = ApiKeyRecord::new(options.name, options.credits);
        record.namespace = options.namespace.clone();
        record.group = options.group.clone();
        record.tags = options.tags;
        record.tags.truncate(MAX_TAGS_PER_KEY);
        record.allowed_tools = options.allowed_tools;
        record.denied_tools = options.denied_tools;
        record.ip_allowlist = options.ip_allowlist;
        record.quota = options.quota;
        record.spending_limit = options.spending_limit;
        record.expires_at = options.expires_at;
        record.auto_topup = options.auto_topup;

        if let Some(alias) = options.alias {
            let mut aliases = self.aliases.lock().unwrap();
            if aliases.contains_key(&alias) {
                return Err(KeyStoreError::AliasTaken(alias));
            }
            aliases.insert(alias.clone(), record.key.clone());
            record.alias = Some(alias);
        }

        self.index_insert(&record);
        self.records.insert(record.key.clone(), record.clone());
        self.mark_dirty();
        tracing::info!(key = %redact(&record.key), name = %record.name, "api key created");
        Ok(record)
    }

    /// Lookup filtered to usable records (active, not suspended, not expired).
    pub fn get(&self, key: &str) -> Option<ApiKeyRecord> {
        let record = self.records.get(key)?;
        if record.is_usable(Utc::now()) {
            Some(record.clone())
        } else {
            None
        }
    }

    /// Unfiltered lookup for admin views and for the Gate, which needs the
    /// record regardless of state to report the precise deny reason.
    pub fn get_raw(&self, key: &str) -> Option<ApiKeyRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    pub fn get_by_alias(&self, alias: &str) -> Option<ApiKeyRecord> {
        let key = self.aliases.lock().unwrap().get(alias)?.clone();
        self.get_raw(&key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    // ------------------------------------------------------------------
    // Credit mutation
    // ------------------------------------------------------------------

    /// The atomic check-and-deduct. If the record exists, is usable, and has
    /// `credits ≥ amount`: `credits -= amount`, `totalSpent += amount`,
    /// `totalCalls += 1` as one indivisible step. Otherwise nothing changes
    /// and the call returns false.
    pub fn try_deduct(&self, key: &str, amount: u64) -> bool {
        let Some(mut record) = self.records.get_mut(key) else {
            return false;
        };
        if !record.is_usable(Utc::now()) || record.credits < amount {
            return false;
        }
        let before = record.credits;
        record.credits -= amount;
        record.total_spent += amount;
        record.total_calls += 1;
        record.last_used_at = Some(Utc::now());
        let after = record.credits;
        record.push_ledger(LedgerEntryType::Charge, amount, before, after, None);
        drop(record);
        self.mark_dirty();
        true
    }

    /// Reverse a deduction (backend failure with refundOnFailure on).
    pub fn refund(&self, key: &str, amount: u64, memo: Option<String>) -> bool {
        let Some(mut record) = self.records.get_mut(key) else {
            return false;
        };
        let before = record.credits;
        record.credits += amount;
        record.total_spent = record.total_spent.saturating_sub(amount);
        let after = record.credits;
        record.push_ledger(LedgerEntryType::Refund, amount, before, after, memo);
        drop(record);
        self.mark_dirty();
        true
    }

    pub fn add_credits(
        &self,
        key: &str,
        amount: u64,
        entry_type: LedgerEntryType,
        memo: Option<String>,
    ) -> Result<u64> {
        let mut record = self.records.get_mut(key).ok_or(KeyStoreError::NotFound)?;
        let before = record.credits;
        record.credits += amount;
        let after = record.credits;
        record.push_ledger(entry_type, amount, before, after, memo);
        drop(record);
        self.mark_dirty();
        Ok(after)
    }

    /// Auto top-up: when the balance after a prospective charge would fall
    /// below the configured threshold and the per-day cap permits, raise the
    /// balance and fire the hook. Returns the new balance when it ran.
    pub fn maybe_auto_topup(&self, key: &str, credits_required: u64) -> Option<u64> {
        let now = Utc::now();
        let today = utc_day(now);
        let (amount, after) = {
            let mut record = self.records.get_mut(key)?;
            let cfg = record.auto_topup.clone()?;
            if record.credits.saturating_sub(credits_required) >= cfg.threshold {
                return None;
            }

            // per-day cap, reset on UTC day change
            let mut cfg = cfg;
            if cfg.last_charge_day.as_deref() != Some(today.as_str()) {
                cfg.per_day_charged = 0;
                cfg.last_charge_day = Some(today.clone());
            }
            if cfg.max_daily > 0 && cfg.per_day_charged >= cfg.max_daily {
                record.auto_topup = Some(cfg);
                return None;
            }
            cfg.per_day_charged += 1;

            let before = record.credits;
            record.credits += cfg.amount;
            let after = record.credits;
            let amount = cfg.amount;
            record.push_ledger(LedgerEntryType::AutoTopup, amount, before, after, None);
            record.auto_topup = Some(cfg);
            (amount, after)
        };
        self.mark_dirty();
        tracing::info!(key = %redact(key), amount, balance = after, "auto top-up applied");
        if let Some(hook) = self.topup_hook.read().unwrap().as_ref() {
            hook(key, amount);
        }
        Some(after)
    }

    // ------------------------------------------------------------------
    // Policy mutation
    // ------------------------------------------------------------------

    pub fn set_acl(
        &self,
        key: &str,
        allowed_tools: Vec<String>,
        denied_tools: Vec<String>,
    ) -> Result<()> {
        self.with_record(key, |record| {
            record.allowed_tools = allowed_tools;
            record.denied_tools = denied_tools;
        })
    }

    pub fn set_quota(&self, key: &str, quota: Option<QuotaConfig>) -> Result<()> {
        self.with_record(key, |record| record.quota = quota)
    }

    pub fn set_tags(&self, key: &str, mut tags: Vec<String>) -> Result<()> {
        tags.truncate(MAX_TAGS_PER_KEY);
        self.with_record(key, |record| record.tags = tags)
    }

    pub fn add_note(&self, key: &str, note: String) -> Result<()> {
        self.with_record(key, |record| {
            record.notes.push(note);
            if record.notes.len() > MAX_NOTES_PER_KEY {
                let excess = record.notes.len() - MAX_NOTES_PER_KEY;
                record.notes.drain(..excess);
            }
        })
    }

    pub fn set_ip_allowlist(&self, key: &str, allowlist: Vec<String>) -> Result<()> {
        self.with_record(key, |record| record.ip_allowlist = allowlist)
    }

    pub fn set_expiry(&self, key: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        self.with_record(key, |record| record.expires_at = expires_at)
    }

    pub fn set_spending_limit(&self, key: &str, limit: u64) -> Result<()> {
        self.with_record(key, |record| record.spending_limit = limit)
    }

    pub fn set_auto_topup(&self, key: &str, cfg: Option<AutoTopupConfig>) -> Result<()> {
        self.with_record(key, |record| record.auto_topup = cfg)
    }

    /// Alias assignment keeps the secondary index in lockstep: the alias
    /// lock is held across both map updates.
    pub fn set_alias(&self, key: &str, alias: Option<String>) -> Result<()> {
        let mut aliases = self.aliases.lock().unwrap();
        if let Some(ref new_alias) = alias {
            if let Some(owner) = aliases.get(new_alias) {
                if owner != key {
                    return Err(KeyStoreError::AliasTaken(new_alias.clone()));
                }
            }
        }
        let mut record = self.records.get_mut(key).ok_or(KeyStoreError::NotFound)?;
        if let Some(old) = record.alias.take() {
            aliases.remove(&old);
        }
        if let Some(new_alias) = alias {
            aliases.insert(new_alias.clone(), key.to_string());
            record.alias = Some(new_alias);
        }
        drop(record);
        drop(aliases);
        self.mark_dirty();
        Ok(())
    }

    pub fn suspend(&self, key: &str) -> Result<()> {
        self.with_record(key, |record| record.suspended = true)
    }

    pub fn resume(&self, key: &str) -> Result<()> {
        self.with_record(key, |record| record.suspended = false)
    }

    /// Revocation is terminal. Repeated calls return false and leave the
    /// record untouched.
    pub fn revoke(&self, key: &str) -> bool {
        let Some(mut record) = self.records.get_mut(key) else {
            return false;
        };
        if !record.active {
            return false;
        }
        record.active = false;
        drop(record);
        self.mark_dirty();
        tracing::info!(key = %redact(key), "api key revoked");
        true
    }

    /// Rotate: a new key string replaces the old one, preserving all
    /// counters, policy and the alias. The old record is revoked.
    pub fn rotate(&self, key: &str) -> Result<ApiKeyRecord> {
        let old = self.records.get(key).ok_or(KeyStoreError::NotFound)?.clone();
        if !old.active {
            return Err(KeyStoreError::Revoked);
        }

        let mut rotated = old.clone();
        rotated.key = generate_key();
        rotated.created_at = Utc::now();

        {
            let mut aliases = self.aliases.lock().unwrap();
            if let Some(ref alias) = rotated.alias {
                aliases.insert(alias.clone(), rotated.key.clone());
            }
            if let Some(mut old_record) = self.records.get_mut(key) {
                old_record.active = false;
                old_record.alias = None;
            }
        }

        self.index_insert(&rotated);
        self.records.insert(rotated.key.clone(), rotated.clone());
        self.mark_dirty();
        tracing::info!(old = %redact(key), new = %redact(&rotated.key), "api key rotated");
        Ok(rotated)
    }

    /// Clone policy (ACL, quota, limits, tags) into a fresh key with its own
    /// balance and zeroed counters.
    pub fn clone_key(&self, key: &str, name: String, credits: u64) -> Result<ApiKeyRecord> {
        let source = self.records.get(key).ok_or(KeyStoreError::NotFound)?.clone();
        self.create(CreateKeyOptions {
            name,
            credits,
            alias: None,
            namespace: source.namespace.clone(),
            group: source.group.clone(),
            tags: source.tags.clone(),
            allowed_tools: source.allowed_tools.clone(),
            denied_tools: source.denied_tools.clone(),
            ip_allowlist: source.ip_allowlist.clone(),
            quota: source.quota,
            spending_limit: source.spending_limit,
            expires_at: source.expires_at,
            auto_topup: source.auto_topup.clone(),
        })
    }

    /// Run a closure against the live record under the store's entry lock.
    /// Used by the Gate for quota accounting so rollover + counters mutate
    /// the same record the deduction did.
    pub fn with_record_mut<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut ApiKeyRecord) -> T,
    ) -> Option<T> {
        let mut record = self.records.get_mut(key)?;
        let out = f(&mut record);
        drop(record);
        self.mark_dirty();
        Some(out)
    }

    fn with_record(&self, key: &str, f: impl FnOnce(&mut ApiKeyRecord)) -> Result<()> {
        let mut record = self.records.get_mut(key).ok_or(KeyStoreError::NotFound)?;
        f(&mut record);
        drop(record);
        self.mark_dirty();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Listing / stats
    // ------------------------------------------------------------------

    pub fn list(&self, filter: &ListFilter) -> (Vec<ApiKeyRecord>, usize) {
        let now = Utc::now();
        let mut matched: Vec<ApiKeyRecord> = self
            .records
            .iter()
            .filter(|r| {
                (!filter.active_only || r.is_usable(now))
                    && filter
                        .namespace
                        .as_ref()
                        .map_or(true, |ns| r.namespace.as_ref() == Some(ns))
                    && filter
                        .group
                        .as_ref()
                        .map_or(true, |g| r.group.as_ref() == Some(g))
                    && filter.tag.as_ref().map_or(true, |t| r.tags.contains(t))
            })
            .map(|r| r.clone())
            .collect();

        match filter.sort {
            SortField::CreatedAt => matched.sort_by_key(|r| r.created_at),
            SortField::Credits => matched.sort_by_key(|r| r.credits),
            SortField::TotalSpent => matched.sort_by_key(|r| r.total_spent),
            SortField::Name => matched.sort_by(|a, b| a.name.cmp(&b.name)),
        }
        if filter.descending {
            matched.reverse();
        }

        let total = matched.len();
        let page = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect();
        (page, total)
    }

    pub fn active_key_count(&self) -> usize {
        let now = Utc::now();
        self.records.iter().filter(|r| r.is_usable(now)).count()
    }

    pub fn total_credits(&self) -> u64 {
        self.records.iter().map(|r| r.credits).sum()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn export(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            keys: self.records.iter().map(|r| r.clone()).collect(),
            aliases: self.aliases.lock().unwrap().clone(),
        }
    }

    /// Replace-or-insert every record from a snapshot. Indexes are rebuilt
    /// from the records, not trusted from the file.
    pub fn import(&self, snapshot: Snapshot) -> usize {
        let count = snapshot.keys.len();
        for record in snapshot.keys {
            if let Some(ref alias) = record.alias {
                self.aliases
                    .lock()
                    .unwrap()
                    .insert(alias.clone(), record.key.clone());
            }
            self.index_insert(&record);
            self.records.insert(record.key.clone(), record);
        }
        self.mark_dirty();
        count
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the snapshot atomically: serialize under a consistent view,
    /// write a tmp file, rename over the target. Readers never observe a
    /// torn file.
    pub fn snapshot_save(&self) -> Result<()> {
        let snapshot = self.export();
        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(dir) = self.snapshot_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.snapshot_path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.snapshot_path)?;
        self.dirty.store(false, Ordering::Release);
        tracing::debug!(
            path = %self.snapshot_path.display(),
            keys = snapshot.keys.len(),
            "snapshot flushed"
        );
        Ok(())
    }

    pub fn flush_if_dirty(&self) -> Result<bool> {
        if self.is_dirty() {
            self.snapshot_save()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Populate the map from disk at startup. A missing file is a fresh
    /// start; an unreadable file is fatal (the caller aborts startup).
    pub fn snapshot_load(&self) -> Result<usize> {
        if !Path::new(&self.snapshot_path).exists() {
            return Ok(0);
        }
        let bytes = std::fs::read(&self.snapshot_path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        let count = self.import(snapshot);
        self.dirty.store(false, Ordering::Release);
        tracing::info!(count, path = %self.snapshot_path.display(), "snapshot loaded");
        Ok(count)
    }

    /// Spawn the coalescing flush timer. A mutation marks dirty; this task
    /// persists at most once per interval.
    pub fn spawn_flush_task(self: &Arc<Self>, interval: std::time::Duration) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush_if_dirty() {
                    tracing::error!("snapshot flush failed: {e}");
                }
            }
        });
    }

    fn index_insert(&self, record: &ApiKeyRecord) {
        if let Some(ref ns) = record.namespace {
            self.namespaces
                .lock()
                .unwrap()
                .entry(ns.clone())
                .or_default()
                .insert(record.key.clone());
        }
        if let Some(ref group) = record.group {
            self.groups
                .lock()
                .unwrap()
                .entry(group.clone())
                .or_default()
                .insert(record.key.clone());
        }
    }
}

/// Keys are secrets; logs carry only a prefix.
fn redact(key: &str) -> String {
    if key.len() <= 8 {
        key.to_string()
    } else {
        format!("{}…", &key[..8])
    }
}
