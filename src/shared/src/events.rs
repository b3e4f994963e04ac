//! In-process publish/subscribe bus for lifecycle events
//!
//! Each topic owns a broadcast channel created lazily on first subscription,
//! and a firehose channel receives every event. Slow subscribers observe
//! `RecvError::Lagged` and keep receiving newer events.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Well-known event topics
pub mod topics {
    pub const SERVICE_REGISTERED: &str = "service.registered";
    pub const SERVICE_DEREGISTERED: &str = "service.deregistered";
    pub const SERVICE_STATUS_CHANGED: &str = "service.status_changed";
    pub const CIRCUIT_OPENED: &str = "circuit.opened";
    pub const CIRCUIT_CLOSED: &str = "circuit.closed";
    pub const REQUEST_COMPLETED: &str = "request.completed";
    pub const REQUEST_FAILED: &str = "request.failed";
    pub const SECURITY_THREAT_BLOCKED: &str = "security.threat_blocked";
    pub const SECURITY_ACCESS_ANOMALY: &str = "security.access_anomaly";
    pub const AUTOSCALER_SCALED: &str = "autoscaler.scaled";
}

const DEFAULT_CAPACITY: usize = 256;

/// A single published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshEvent {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl MeshEvent {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Topic-based event bus
#[derive(Debug)]
pub struct EventBus {
    capacity: usize,
    topics: DashMap<String, broadcast::Sender<MeshEvent>>,
    all: broadcast::Sender<MeshEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus whose channels buffer `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            capacity,
            topics: DashMap::new(),
            all,
        }
    }

    /// Receive events published on `topic`
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<MeshEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Receive every event regardless of topic
    pub fn subscribe_all(&self) -> broadcast::Receiver<MeshEvent> {
        self.all.subscribe()
    }

    /// Publish an event and return how many subscribers it was delivered to
    pub fn publish(&self, event: MeshEvent) -> usize {
        let mut delivered = 0;

        if let Some(sender) = self.topics.get(&event.topic) {
            delivered += sender.send(event.clone()).unwrap_or(0);
        }
        delivered += self.all.send(event.clone()).unwrap_or(0);

        trace!(topic = %event.topic, delivered, "Published event");
        delivered
    }

    /// Convenience wrapper building the event in place
    pub fn emit(&self, topic: &str, payload: serde_json::Value) -> usize {
        self.publish(MeshEvent::new(topic, payload))
    }

    /// Number of live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(topics::REQUEST_COMPLETED, json!({})), 0);
    }

    #[tokio::test]
    async fn test_topic_subscription_only_sees_its_topic() {
        let bus = EventBus::default();
        let mut opened = bus.subscribe(topics::CIRCUIT_OPENED);
        let mut firehose = bus.subscribe_all();

        bus.emit(topics::REQUEST_COMPLETED, json!({ "service": "a" }));
        let delivered = bus.emit(topics::CIRCUIT_OPENED, json!({ "service": "b" }));
        assert_eq!(delivered, 2);

        let event = opened.recv().await.unwrap();
        assert_eq!(event.topic, topics::CIRCUIT_OPENED);
        assert_eq!(event.payload, json!({ "service": "b" }));
        assert!(matches!(opened.try_recv(), Err(TryRecvError::Empty)));

        assert_eq!(firehose.recv().await.unwrap().topic, topics::REQUEST_COMPLETED);
        assert_eq!(firehose.recv().await.unwrap().topic, topics::CIRCUIT_OPENED);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_receiving() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe(topics::AUTOSCALER_SCALED);

        for i in 0..5 {
            bus.emit(topics::AUTOSCALER_SCALED, json!({ "seq": i }));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().payload, json!({ "seq": 3 }));
        assert_eq!(rx.recv().await.unwrap().payload, json!({ "seq": 4 }));
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(topics::SERVICE_REGISTERED), 0);
        let _rx = bus.subscribe(topics::SERVICE_REGISTERED);
        assert_eq!(bus.subscriber_count(topics::SERVICE_REGISTERED), 1);
    }
}
