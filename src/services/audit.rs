/// Audit log: bounded ring buffer with live broadcast
///
/// Age- and count-bounded. Admin SSE listeners subscribe through a broadcast
/// channel; a lagging listener misses events rather than blocking the
/// writer.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::events::AuditEvent;

pub const DEFAULT_CAPACITY: usize = 5_000;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

pub struct AuditLogger {
    events: Mutex<VecDeque<AuditEvent>>,
    next_id: AtomicU64,
    capacity: usize,
    max_age: ChronoDuration,
    live: broadcast::Sender<AuditEvent>,
}

impl AuditLogger {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            events: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            capacity,
            max_age: ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::hours(24)),
            live,
        }
    }

    /// Accepts and enqueues; never blocks the caller on listeners.
    pub fn log(&self, event_type: &str, actor: &str, message: &str, metadata: Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = AuditEvent {
            id,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            message: message.to_string(),
            metadata,
        };

        {
            let mut events = self.events.lock().unwrap();
            let cutoff = Utc::now() - self.max_age;
            while events
                .front()
                .map(|e| e.timestamp < cutoff)
                .unwrap_or(false)
            {
                events.pop_front();
            }
            if events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }

        // broadcast errors just mean nobody is listening
        let _ = self.live.send(event);
        id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.live.subscribe()
    }

    /// Bounded copy of the newest events, optionally filtered by type.
    pub fn query(&self, event_type: Option<&str>, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.lock().unwrap();
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    pub fn export_json(&self) -> Value {
        let events = self.events.lock().unwrap();
        serde_json::to_value(events.iter().collect::<Vec<_>>()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_AGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_assigns_monotonic_ids() {
        let audit = AuditLogger::default();
        let a = audit.log("key_created", "admin", "created", json!({}));
        let b = audit.log("key_revoked", "admin", "revoked", json!({}));
        assert!(b > a);
        assert_eq!(audit.len(), 2);
    }

    #[test]
    fn test_count_bound() {
        let audit = AuditLogger::new(2, DEFAULT_MAX_AGE);
        audit.log("a", "x", "1", json!({}));
        audit.log("b", "x", "2", json!({}));
        audit.log("c", "x", "3", json!({}));
        let all = audit.query(None, 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, "b");
    }

    #[test]
    fn test_query_by_type() {
        let audit = AuditLogger::default();
        audit.log("deny", "gate", "rate", json!({}));
        audit.log("charge", "gate", "ok", json!({}));
        audit.log("deny", "gate", "quota", json!({}));
        let denies = audit.query(Some("deny"), 10);
        assert_eq!(denies.len(), 2);
        assert_eq!(denies[1].message, "quota");
    }

    #[tokio::test]
    async fn test_broadcast_to_listener() {
        let audit = AuditLogger::default();
        let mut rx = audit.subscribe();
        audit.log("key_created", "admin", "hello", json!({"k": 1}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "key_created");
        assert_eq!(event.metadata["k"], 1);
    }

    #[test]
    fn test_log_without_listeners_is_fine() {
        let audit = AuditLogger::default();
        audit.log("noop", "nobody", "still fine", json!({}));
        assert_eq!(audit.len(), 1);
    }
}
