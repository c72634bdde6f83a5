/// Append-only usage ring buffer
///
/// Process-wide singleton owned by the server root. Events for one key are
/// appended in causal order; across keys there is no ordering guarantee.
/// Queries copy out under the lock so readers never observe a partial write.
use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;

use crate::models::events::UsageEvent;

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct UsageMeter {
    events: Mutex<VecDeque<UsageEvent>>,
    capacity: usize,
}

impl UsageMeter {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn record(&self, event: UsageEvent) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Convenience for the Gate's deny path.
    pub fn record_denial(
        &self,
        api_key: &str,
        key_name: &str,
        tool: &str,
        reason: &str,
        duration_ms: u64,
        namespace: Option<String>,
    ) {
        self.record(UsageEvent {
            timestamp: Utc::now(),
            api_key: api_key.to_string(),
            key_name: key_name.to_string(),
            tool: tool.to_string(),
            credits_charged: 0,
            allowed: false,
            deny_reason: Some(reason.to_string()),
            duration_ms,
            namespace,
        });
    }

    /// Most recent `limit` events, newest last.
    pub fn recent(&self, limit: usize) -> Vec<UsageEvent> {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .skip(events.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    pub fn for_key(&self, api_key: &str, limit: usize) -> Vec<UsageEvent> {
        let events = self.events.lock().unwrap();
        let mut matched: Vec<UsageEvent> = events
            .iter()
            .rev()
            .filter(|e| e.api_key == api_key)
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UsageMeter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str, tool: &str, allowed: bool) -> UsageEvent {
        UsageEvent {
            timestamp: Utc::now(),
            api_key: key.to_string(),
            key_name: "n".into(),
            tool: tool.to_string(),
            credits_charged: if allowed { 1 } else { 0 },
            allowed,
            deny_reason: None,
            duration_ms: 1,
            namespace: None,
        }
    }

    #[test]
    fn test_ring_drops_oldest() {
        let meter = UsageMeter::new(3);
        for i in 0..5 {
            meter.record(event("k", &format!("t{i}"), true));
        }
        let recent = meter.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].tool, "t2");
        assert_eq!(recent[2].tool, "t4");
    }

    #[test]
    fn test_per_key_causal_order() {
        let meter = UsageMeter::new(100);
        meter.record(event("a", "first", true));
        meter.record(event("b", "x", true));
        meter.record(event("a", "second", false));

        let for_a = meter.for_key("a", 10);
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].tool, "first");
        assert_eq!(for_a[1].tool, "second");
    }

    #[test]
    fn test_record_denial_shape() {
        let meter = UsageMeter::default();
        meter.record_denial("k", "name", "search", "rate_limited", 3, None);
        let events = meter.recent(1);
        assert!(!events[0].allowed);
        assert_eq!(events[0].deny_reason.as_deref(), Some("rate_limited"));
        assert_eq!(events[0].credits_charged, 0);
    }
}
