//! Optional publish/subscribe collaborator used for `trigger` activation and
//! cross-component readiness announcements.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Topic on which the coordinator announces components that became ready
pub const COMPONENT_READY_TOPIC: &str = "component.ready";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub trait MessageBus: Send + Sync {
    /// Publish a payload; returns the number of subscribers reached
    fn publish(&self, topic: &str, payload: serde_json::Value) -> usize;

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
}

/// In-process topic bus, one broadcast channel per topic
pub struct LocalMessageBus {
    topics: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
}

impl LocalMessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalMessageBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl MessageBus for LocalMessageBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        let delivered = self.sender(topic).send(message).unwrap_or(0);
        debug!("Published on {} to {} subscribers", topic, delivered);
        delivered
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender(topic).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = LocalMessageBus::default();
        let mut ready = bus.subscribe(COMPONENT_READY_TOPIC);
        let mut other = bus.subscribe("other");

        assert_eq!(bus.publish(COMPONENT_READY_TOPIC, json!({"component": "hermes"})), 1);
        let message = ready.recv().await.unwrap();
        assert_eq!(message.payload["component"], "hermes");
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = LocalMessageBus::default();
        assert_eq!(bus.publish("nobody", json!(null)), 0);
    }
}
