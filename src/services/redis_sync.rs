/// Distributed state mirror: Redis atomic counters + pub/sub invalidation
///
/// When a Redis URL is configured, the credit decision moves to Redis:
/// `DECRBY` with rollback-on-underflow is the one operation all replicas
/// must agree on. Everything else is best-effort mirroring — non-counter
/// fields resolve last-write-wins, and peers converge by refreshing their
/// local record when a pub/sub message lands.
///
/// If Redis is unreachable, local decisions proceed on in-memory state with
/// the health flag flipped; failed mirror writes retry out-of-band on a
/// bounded backoff.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::api_key::ApiKeyRecord;
use crate::services::key_store::KeyStore;
use crate::services::scoped_token::ScopedTokenManager;

pub const EVENTS_CHANNEL: &str = "paygate:events";
const RETRY_QUEUE_CAPACITY: usize = 512;
const RETRY_MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

pub fn key_slot(key: &str) -> String {
    format!("paygate:key:{key}")
}

pub fn credits_slot(key: &str) -> String {
    format!("paygate:credits:{key}")
}

pub fn totals_slot(key: &str) -> String {
    format!("paygate:totals:{key}")
}

/// Everything replicas tell each other over `paygate:events`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    KeyUpdated { key: String },
    KeyRevoked { key: String },
    TokenRevoked { fingerprint: String, expires_at: i64 },
    GroupUpdated { group: String },
    TemplateUpdated { template: String },
}

/// A mirror write that failed and is being retried out-of-band.
#[derive(Debug, Clone)]
enum RetryOp {
    MirrorKey(Box<ApiKeyRecord>),
    Publish(SyncMessage),
}

pub struct RedisSync {
    manager: ConnectionManager,
    client: redis::Client,
    healthy: AtomicBool,
    retry_tx: mpsc::Sender<RetryOp>,
}

impl RedisSync {
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        let (retry_tx, retry_rx) = mpsc::channel(RETRY_QUEUE_CAPACITY);

        let sync = Arc::new(Self {
            manager,
            client,
            healthy: AtomicBool::new(true),
            retry_tx,
        });
        sync.spawn_retry_worker(retry_rx);
        tracing::info!("✅ redis sync connected");
        Ok(sync)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn mark(&self, ok: bool) {
        let was = self.healthy.swap(ok, Ordering::AcqRel);
        if was != ok {
            if ok {
                tracing::info!("redis sync recovered");
            } else {
                tracing::error!("redis sync degraded, falling back to local state");
            }
        }
    }

    // ------------------------------------------------------------------
    // Atomic counter ops (authoritative across replicas)
    // ------------------------------------------------------------------

    /// Distributed deduct: `DECRBY` then roll back on underflow. Returns
    /// `None` when Redis is unreachable (caller falls back to local state).
    pub async fn try_deduct(&self, key: &str, amount: u64) -> Option<bool> {
        let mut conn = self.manager.clone();
        let slot = credits_slot(key);
        let after: i64 = match conn.decr(&slot, amount as i64).await {
            Ok(v) => v,
            Err(e) => {
                self.mark(false);
                tracing::warn!("redis DECRBY failed: {e}");
                return None;
            }
        };
        self.mark(true);

        if after < 0 {
            // underflow: undo and deny
            let _: std::result::Result<i64, _> = conn.incr(&slot, amount as i64).await;
            return Some(false);
        }

        let totals = totals_slot(key);
        let _: std::result::Result<i64, _> =
            conn.hincr(&totals, "totalSpent", amount as i64).await;
        let _: std::result::Result<i64, _> = conn.hincr(&totals, "totalCalls", 1).await;
        Some(true)
    }

    /// Topup / refund path: `INCRBY` then announce.
    pub async fn add_credits(&self, key: &str, amount: u64) {
        let mut conn = self.manager.clone();
        let result: std::result::Result<i64, _> =
            conn.incr(credits_slot(key), amount as i64).await;
        match result {
            Ok(_) => {
                self.mark(true);
                self.publish(SyncMessage::KeyUpdated {
                    key: key.to_string(),
                })
                .await;
            }
            Err(e) => {
                self.mark(false);
                tracing::warn!("redis INCRBY failed: {e}");
                self.enqueue_retry(RetryOp::Publish(SyncMessage::KeyUpdated {
                    key: key.to_string(),
                }));
            }
        }
    }

    /// Reverse a distributed charge, totals included.
    pub async fn refund(&self, key: &str, amount: u64) {
        let mut conn = self.manager.clone();
        let result: std::result::Result<i64, _> =
            conn.incr(credits_slot(key), amount as i64).await;
        if result.is_err() {
            self.mark(false);
            return;
        }
        let totals = totals_slot(key);
        let _: std::result::Result<i64, _> =
            conn.hincr(&totals, "totalSpent", -(amount as i64)).await;
        self.mark(true);
    }

    /// Seed the counter when a key is created or imported.
    pub async fn init_credits(&self, key: &str, credits: u64) {
        let mut conn = self.manager.clone();
        let result: std::result::Result<(), _> =
            conn.set(credits_slot(key), credits as i64).await;
        if let Err(e) = result {
            self.mark(false);
            tracing::warn!("redis credit seed failed: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Mirroring + pub/sub
    // ------------------------------------------------------------------

    /// `SET paygate:key:<k>` + publish `key_updated`.
    pub async fn mirror_key(&self, record: &ApiKeyRecord) {
        let json = match serde_json::to_string(record) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("record serialize failed: {e}");
                return;
            }
        };
        let mut conn = self.manager.clone();
        let result: std::result::Result<(), _> = conn.set(key_slot(&record.key), json).await;
        match result {
            Ok(()) => {
                self.mark(true);
                self.publish(SyncMessage::KeyUpdated {
                    key: record.key.clone(),
                })
                .await;
            }
            Err(e) => {
                self.mark(false);
                tracing::warn!("redis key mirror failed: {e}");
                self.enqueue_retry(RetryOp::MirrorKey(Box::new(record.clone())));
            }
        }
    }

    pub async fn publish(&self, message: SyncMessage) {
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(_) => return,
        };
        let mut conn = self.manager.clone();
        let result: std::result::Result<i64, _> = conn.publish(EVENTS_CHANNEL, payload).await;
        if let Err(e) = result {
            self.mark(false);
            tracing::warn!("redis publish failed: {e}");
            self.enqueue_retry(RetryOp::Publish(message));
        } else {
            self.mark(true);
        }
    }

    pub async fn publish_token_revoked(&self, fingerprint: &str, expires_at: DateTime<Utc>) {
        self.publish(SyncMessage::TokenRevoked {
            fingerprint: fingerprint.to_string(),
            expires_at: expires_at.timestamp(),
        })
        .await;
    }

    /// Dedicated subscriber connection. Messages lead this replica to
    /// refresh its cached record from Redis or grow its revocation list.
    pub fn spawn_subscriber(
        self: &Arc<Self>,
        key_store: Arc<KeyStore>,
        tokens: Arc<ScopedTokenManager>,
    ) {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match sync.run_subscriber(&key_store, &tokens).await {
                    Ok(()) => break,
                    Err(e) => {
                        sync.mark(false);
                        tracing::warn!("redis subscriber lost: {e}, reconnecting");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    async fn run_subscriber(
        &self,
        key_store: &Arc<KeyStore>,
        tokens: &Arc<ScopedTokenManager>,
    ) -> Result<()> {
        #[allow(deprecated)]
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(EVENTS_CHANNEL).await?;
        self.mark(true);
        let mut stream = pubsub.on_message();

        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(_) => continue,
            };
            let Ok(message) = serde_json::from_str::<SyncMessage>(&payload) else {
                continue;
            };
            match message {
                SyncMessage::KeyUpdated { key } => {
                    if let Some(record) = self.fetch_record(&key).await {
                        key_store.import(crate::services::key_store::Snapshot {
                            version: crate::services::key_store::SNAPSHOT_VERSION,
                            keys: vec![record],
                            aliases: Default::default(),
                        });
                    }
                }
                SyncMessage::KeyRevoked { key } => {
                    key_store.revoke(&key);
                }
                SyncMessage::TokenRevoked {
                    fingerprint,
                    expires_at,
                } => {
                    let expires = DateTime::from_timestamp(expires_at, 0)
                        .unwrap_or_else(|| Utc::now() + chrono::Duration::days(1));
                    tokens.revoke_fingerprint(&fingerprint, expires);
                }
                SyncMessage::GroupUpdated { group } => {
                    tracing::debug!(group, "group invalidation received");
                }
                SyncMessage::TemplateUpdated { template } => {
                    tracing::debug!(template, "template invalidation received");
                }
            }
        }
        Ok(())
    }

    async fn fetch_record(&self, key: &str) -> Option<ApiKeyRecord> {
        let mut conn = self.manager.clone();
        let json: String = conn.get(key_slot(key)).await.ok()?;
        serde_json::from_str(&json).ok()
    }

    // ------------------------------------------------------------------
    // Out-of-band retry
    // ------------------------------------------------------------------

    fn enqueue_retry(&self, op: RetryOp) {
        if self.retry_tx.try_send(op).is_err() {
            tracing::error!("redis retry queue full, dropping operation");
        }
    }

    fn spawn_retry_worker(self: &Arc<Self>, mut rx: mpsc::Receiver<RetryOp>) {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let mut backoff = RETRY_BACKOFF_BASE;
                for attempt in 1..=RETRY_MAX_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    let ok = match &op {
                        RetryOp::MirrorKey(record) => sync.try_mirror_once(record).await,
                        RetryOp::Publish(message) => sync.try_publish_once(message).await,
                    };
                    if ok {
                        sync.mark(true);
                        break;
                    }
                    if attempt == RETRY_MAX_ATTEMPTS {
                        tracing::error!("redis retry exhausted after {attempt} attempts");
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        });
    }

    async fn try_mirror_once(&self, record: &ApiKeyRecord) -> bool {
        let Ok(json) = serde_json::to_string(record) else {
            return true;
        };
        let mut conn = self.manager.clone();
        let result: std::result::Result<(), _> = conn.set(key_slot(&record.key), json).await;
        result.is_ok()
    }

    async fn try_publish_once(&self, message: &SyncMessage) -> bool {
        let Ok(payload) = serde_json::to_string(message) else {
            return true;
        };
        let mut conn = self.manager.clone();
        let result: std::result::Result<i64, _> = conn.publish(EVENTS_CHANNEL, payload).await;
        result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(key_slot("pg_abc"), "paygate:key:pg_abc");
        assert_eq!(credits_slot("pg_abc"), "paygate:credits:pg_abc");
        assert_eq!(totals_slot("pg_abc"), "paygate:totals:pg_abc");
    }

    #[test]
    fn test_sync_message_wire_format() {
        let msg = SyncMessage::KeyUpdated {
            key: "pg_x".into(),
        };
        let s = serde_json::to_string(&msg).unwrap();
        assert_eq!(s, r#"{"type":"key_updated","key":"pg_x"}"#);

        let revoked: SyncMessage = serde_json::from_str(
            r#"{"type":"token_revoked","fingerprint":"ff00","expires_at":1700000000}"#,
        )
        .unwrap();
        assert_eq!(
            revoked,
            SyncMessage::TokenRevoked {
                fingerprint: "ff00".into(),
                expires_at: 1_700_000_000
            }
        );
    }

    #[test]
    fn test_unknown_message_type_ignored() {
        let parsed = serde_json::from_str::<SyncMessage>(r#"{"type":"surprise"}"#);
        assert!(parsed.is_err());
    }
}
