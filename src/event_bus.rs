//! Topic-based publish/subscribe used to decouple the scheduler, reaper,
//! and API/WebSocket layers from each other and from `TaskQueue` /
//! `GoalBacklog` / `AgentRegistry` internals.
//!
//! Grounded in the teacher's `mpsc::unbounded_channel` result-fanout in
//! the orchestrator's run loop, generalized to multiple named topics
//! with **bounded** per-subscriber queues: publish must never block on
//! a slow subscriber, so a full queue drops the newest message and
//! counts the drop rather than awaiting capacity.

use crate::constants::EVENT_BUS_SUBSCRIBER_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Topic {
    Tasks,
    Goals,
    HubFsm,
    RateLimits,
    Presence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub kind: String,
    pub payload: serde_json::Value,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl Event {
    pub fn new(topic: Topic, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic,
            kind: kind.into(),
            payload,
            at: chrono::Utc::now(),
        }
    }
}

struct Subscriber {
    sender: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<Topic, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(EVENT_BUS_SUBSCRIBER_QUEUE_CAPACITY);
        let mut subs = self.subscribers.write().await;
        subs.entry(topic).or_default().push(Subscriber {
            sender: tx,
            dropped: Arc::new(AtomicU64::new(0)),
        });
        rx
    }

    /// Never blocks. A full subscriber queue drops the new event and
    /// increments that subscriber's drop counter.
    pub async fn publish(&self, event: Event) {
        let subs = self.subscribers.read().await;
        if let Some(list) = subs.get(&event.topic) {
            for sub in list {
                if let Err(e) = sub.sender.try_send(event.clone()) {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "event bus dropped {:?} event for a slow subscriber: {}",
                        event.topic, e
                    );
                }
            }
        }
    }

    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .read()
            .await
            .get(&topic)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_delivers_to_matching_topic_only() {
        let bus = EventBus::new();
        let mut tasks_rx = bus.subscribe(Topic::Tasks).await;
        let mut goals_rx = bus.subscribe(Topic::Goals).await;

        bus.publish(Event::new(Topic::Tasks, "submitted", serde_json::json!({})))
            .await;

        assert!(tasks_rx.try_recv().is_ok());
        assert!(goals_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_never_blocks_on_full_queue() {
        let bus = EventBus::new();
        let _rx = bus.subscribe(Topic::Tasks).await;

        for _ in 0..(EVENT_BUS_SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish(Event::new(Topic::Tasks, "tick", serde_json::json!({})))
                .await;
        }
        // if publish blocked on the full queue this test would hang
    }
}
