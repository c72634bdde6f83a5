/// Streamable-HTTP session layer: correlation ids + per-session SSE fan-out
///
/// A session is rolling: every request refreshes its activity stamp. Idle
/// sessions past the timeout are destroyed by a fixed-cadence sweeper, and
/// destruction closes every SSE writer registered to the session (dropping
/// the channel sender ends the stream on the handler side).
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::models::api_key::generate_session_id;

/// Per-connection buffer before a slow SSE consumer counts as dead.
const SSE_CHANNEL_CAPACITY: usize = 64;
/// Sweep cadence for idle-session eviction.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub api_key: Option<String>,
    last_activity: Instant,
    senders: Vec<mpsc::Sender<Value>>,
}

/// Cloneable view for handlers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub api_key: Option<String>,
    pub sse_connections: usize,
}

pub struct SessionManager {
    sessions: DashMap<String, Session>,
    timeout: Duration,
    max_sessions: usize,
    max_sse_per_session: usize,
}

impl SessionManager {
    pub fn new(timeout: Duration, max_sessions: usize, max_sse_per_session: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout,
            max_sessions,
            max_sse_per_session,
        }
    }

    /// Create a session, evicting the least-recently-active one when the
    /// bound is hit.
    pub fn create_session(&self, api_key: Option<String>) -> String {
        if self.sessions.len() >= self.max_sessions {
            if let Some(lru) = self
                .sessions
                .iter()
                .min_by_key(|s| s.last_activity)
                .map(|s| s.id.clone())
            {
                tracing::warn!(session = %lru, "session table full, evicting LRU");
                self.destroy_session(&lru);
            }
        }

        let id = generate_session_id();
        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                created_at: Utc::now(),
                api_key,
                last_activity: Instant::now(),
                senders: Vec::new(),
            },
        );
        id
    }

    /// Fetch-and-touch. A session idle past the timeout is destroyed on
    /// access and reported as absent.
    pub fn get_session(&self, id: &str) -> Option<SessionInfo> {
        {
            let mut session = self.sessions.get_mut(id)?;
            if session.last_activity.elapsed() >= self.timeout {
                drop(session);
                self.destroy_session(id);
                return None;
            }
            session.last_activity = Instant::now();
        }
        self.sessions.get(id).map(|s| SessionInfo {
            id: s.id.clone(),
            created_at: s.created_at,
            api_key: s.api_key.clone(),
            sse_connections: s.senders.len(),
        })
    }

    /// Bind an authenticated key to a session created anonymously.
    pub fn bind_api_key(&self, id: &str, api_key: &str) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            if session.api_key.is_none() {
                session.api_key = Some(api_key.to_string());
            }
        }
    }

    /// Register an SSE writer. Bounded per session; the receiver half drives
    /// the actual HTTP stream.
    pub fn add_sse_connection(&self, id: &str) -> Option<mpsc::Receiver<Value>> {
        let mut session = self.sessions.get_mut(id)?;
        if session.senders.len() >= self.max_sse_per_session {
            tracing::warn!(session = %id, "SSE connection bound reached");
            return None;
        }
        let (tx, rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
        session.senders.push(tx);
        session.last_activity = Instant::now();
        Some(rx)
    }

    /// Fan a payload out to every live writer, dropping dead ones. Delivery
    /// within one session preserves enqueue order.
    pub fn send_notification(&self, id: &str, payload: Value) -> usize {
        let Some(mut session) = self.sessions.get_mut(id) else {
            return 0;
        };
        session
            .senders
            .retain(|tx| tx.try_send(payload.clone()).is_ok());
        session.senders.len()
    }

    /// Destroy a session; dropping the senders closes every SSE stream.
    pub fn destroy_session(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                tracing::debug!(
                    session = %id,
                    sse = session.senders.len(),
                    "session destroyed"
                );
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Destroy every session idle past the timeout. Returns how many died.
    pub fn sweep(&self) -> usize {
        let timeout = self.timeout;
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.last_activity.elapsed() >= timeout)
            .map(|s| s.id.clone())
            .collect();
        for id in &stale {
            self.destroy_session(id);
        }
        stale.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let evicted = manager.sweep();
                if evicted > 0 {
                    tracing::info!(evicted, "idle sessions destroyed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(timeout_ms: u64, max_sessions: usize) -> SessionManager {
        SessionManager::new(Duration::from_millis(timeout_ms), max_sessions, 4)
    }

    #[test]
    fn test_create_and_get() {
        let mgr = manager(5_000, 10);
        let id = mgr.create_session(Some("pg_k".into()));
        assert!(id.starts_with("mcp_sess_"));
        let info = mgr.get_session(&id).unwrap();
        assert_eq!(info.api_key.as_deref(), Some("pg_k"));
        assert!(mgr.get_session("mcp_sess_unknown").is_none());
    }

    #[tokio::test]
    async fn test_idle_timeout_destroys_on_access() {
        let mgr = manager(30, 10);
        let id = mgr.create_session(None);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(mgr.get_session(&id).is_none());
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_closes_sse_writers() {
        let mgr = manager(30, 10);
        let id = mgr.create_session(None);
        let mut rx = mgr.add_sse_connection(&id).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(mgr.sweep(), 1);

        // sender dropped with the session: the stream ends
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_lru_eviction_on_overflow() {
        let mgr = manager(60_000, 2);
        let first = mgr.create_session(None);
        let second = mgr.create_session(None);
        // touch `first` so `second` is the LRU
        std::thread::sleep(Duration::from_millis(5));
        mgr.get_session(&first);

        let third = mgr.create_session(None);
        assert_eq!(mgr.active_count(), 2);
        assert!(mgr.get_session(&second).is_none());
        assert!(mgr.get_session(&first).is_some());
        assert!(mgr.get_session(&third).is_some());
    }

    #[tokio::test]
    async fn test_notification_fanout_in_order() {
        let mgr = manager(5_000, 10);
        let id = mgr.create_session(None);
        let mut rx1 = mgr.add_sse_connection(&id).unwrap();
        let mut rx2 = mgr.add_sse_connection(&id).unwrap();

        assert_eq!(mgr.send_notification(&id, json!({"n": 1})), 2);
        assert_eq!(mgr.send_notification(&id, json!({"n": 2})), 2);

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap()["n"], 1);
            assert_eq!(rx.recv().await.unwrap()["n"], 2);
        }
    }

    #[tokio::test]
    async fn test_dead_writers_dropped() {
        let mgr = manager(5_000, 10);
        let id = mgr.create_session(None);
        let rx = mgr.add_sse_connection(&id).unwrap();
        drop(rx);
        assert_eq!(mgr.send_notification(&id, json!({})), 0);
    }

    #[test]
    fn test_sse_bound_per_session() {
        let mgr = SessionManager::new(Duration::from_secs(5), 10, 2);
        let id = mgr.create_session(None);
        assert!(mgr.add_sse_connection(&id).is_some());
        assert!(mgr.add_sse_connection(&id).is_some());
        assert!(mgr.add_sse_connection(&id).is_none());
    }

    #[test]
    fn test_destroy_idempotent() {
        let mgr = manager(5_000, 10);
        let id = mgr.create_session(None);
        assert!(mgr.destroy_session(&id));
        assert!(!mgr.destroy_session(&id));
    }
}
