/// Fire-and-forget webhook dispatch with retry and a dead-letter list
///
/// `emit` never blocks the request path: events go onto a bounded queue
/// drained by a worker task. Delivery failures retry with exponential
/// backoff; an event that exhausts its retries (or cannot even be queued)
/// lands in the dead-letter list for admin replay.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

const QUEUE_CAPACITY: usize = 1024;
const MAX_ATTEMPTS: u32 = 4;
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const DEAD_LETTER_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: WebhookEvent,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WebhookEmitter {
    tx: mpsc::Sender<WebhookEvent>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
}

impl WebhookEmitter {
    /// Spawn the drain worker. With no URL configured the worker still
    /// drains the queue so emitters never back up.
    pub fn new(url: Option<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<WebhookEvent>(QUEUE_CAPACITY);
        let dead_letters: Arc<Mutex<VecDeque<DeadLetter>>> =
            Arc::new(Mutex::new(VecDeque::new()));

        let worker_dead = Arc::clone(&dead_letters);
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            while let Some(event) = rx.recv().await {
                let Some(ref target) = url else { continue };
                if let Err(last_error) = deliver(&client, target, &event).await {
                    push_dead_letter(&worker_dead, event, MAX_ATTEMPTS, last_error);
                }
            }
        });

        Self { tx, dead_letters }
    }

    /// Accepts and enqueues without blocking. Queue overflow goes straight
    /// to the dead-letter list.
    pub fn emit(&self, event_type: &str, actor: &str, metadata: Value) {
        let event = WebhookEvent {
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            timestamp: Utc::now(),
            metadata,
        };
        if let Err(err) = self.tx.try_send(event) {
            let event = match err {
                mpsc::error::TrySendError::Full(e) => e,
                mpsc::error::TrySendError::Closed(e) => e,
            };
            push_dead_letter(&self.dead_letters, event, 0, "queue full".to_string());
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().unwrap().iter().cloned().collect()
    }

    /// Admin replay: drain the dead-letter list back onto the queue.
    /// Returns how many were re-enqueued.
    pub fn replay_dead_letters(&self) -> usize {
        let drained: Vec<DeadLetter> = {
            let mut letters = self.dead_letters.lock().unwrap();
            letters.drain(..).collect()
        };
        let mut replayed = 0;
        for letter in drained {
            if self.tx.try_send(letter.event.clone()).is_ok() {
                replayed += 1;
            } else {
                push_dead_letter(
                    &self.dead_letters,
                    letter.event,
                    letter.attempts,
                    letter.last_error,
                );
            }
        }
        replayed
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().unwrap().len()
    }
}

async fn deliver(
    client: &reqwest::Client,
    url: &str,
    event: &WebhookEvent,
) -> std::result::Result<(), String> {
    let mut last_error = String::new();
    for attempt in 0..MAX_ATTEMPTS {
        match client.post(url).json(event).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => last_error = format!("HTTP {}", resp.status()),
            Err(e) => last_error = e.to_string(),
        }
        tracing::warn!(
            url,
            attempt = attempt + 1,
            error = %last_error,
            event_type = %event.event_type,
            "webhook delivery failed"
        );
        if attempt + 1 < MAX_ATTEMPTS {
            tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt)).await;
        }
    }
    Err(last_error)
}

fn push_dead_letter(
    letters: &Arc<Mutex<VecDeque<DeadLetter>>>,
    event: WebhookEvent,
    attempts: u32,
    last_error: String,
) {
    let mut letters = letters.lock().unwrap();
    if letters.len() >= DEAD_LETTER_CAPACITY {
        letters.pop_front();
    }
    tracing::error!(event_type = %event.event_type, error = %last_error, "webhook dead-lettered");
    letters.push_back(DeadLetter {
        event,
        attempts,
        last_error,
        failed_at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_without_url_drains() {
        let emitter = WebhookEmitter::new(None);
        for _ in 0..10 {
            emitter.emit("tool_call", "gate", json!({"tool": "x"}));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(emitter.dead_letter_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_dead_letters() {
        // nothing listens on this port; all attempts fail fast
        let emitter = WebhookEmitter::new(Some("http://127.0.0.1:1/hook".to_string()));
        emitter.emit("key_revoked", "admin", json!({}));

        // retries back off 0.5 + 1 + 2 seconds before dead-lettering
        for _ in 0..80 {
            if emitter.dead_letter_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let letters = emitter.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event.event_type, "key_revoked");
        assert_eq!(letters[0].attempts, MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_replay_requeues() {
        let emitter = WebhookEmitter::new(None);
        push_dead_letter(
            &emitter.dead_letters,
            WebhookEvent {
                event_type: "topup".into(),
                actor: "store".into(),
                timestamp: Utc::now(),
                metadata: json!({}),
            },
            2,
            "HTTP 503".into(),
        );
        assert_eq!(emitter.dead_letter_count(), 1);
        assert_eq!(emitter.replay_dead_letters(), 1);
        assert_eq!(emitter.dead_letter_count(), 0);
    }
}
