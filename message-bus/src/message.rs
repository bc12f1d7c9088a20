//! Message envelope for lifecycle events

use crate::types::PartitionKey;
use batch_engine::events::LifecycleEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message ID, equal to the event ID so redeliveries deduplicate
    pub id: Uuid,

    /// Partition key for routing
    pub partition_key: PartitionKey,

    /// Partition number derived from the key
    pub partition: u32,

    /// Event payload
    pub event: LifecycleEvent,

    /// Publish timestamp
    pub published_at: DateTime<Utc>,
}

impl Message {
    /// Wrap an event, routing it to one of `num_partitions` partitions
    pub fn new(event: LifecycleEvent, num_partitions: u32) -> Self {
        let partition_key = PartitionKey::for_event(&event);
        let partition = partition_key.partition_number(num_partitions);
        Self {
            id: event.event_id,
            partition_key,
            partition,
            event,
            published_at: Utc::now(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// NATS subject: `<prefix>.<kind>.<partition>`
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.{}.{}", prefix, self.event.kind.as_str(), self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_engine::events::EventKind;

    fn event(kind: EventKind) -> LifecycleEvent {
        LifecycleEvent {
            event_id: Uuid::now_v7(),
            kind,
            transaction_id: Some(Uuid::new_v4()),
            batch_id: None,
            enterprise_id: Some(Uuid::new_v4()),
            status: "queued".to_string(),
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_message_uses_event_id() {
        let event = event(EventKind::Enqueued);
        let msg = Message::new(event.clone(), 8);

        assert_eq!(msg.id, event.event_id);
        assert!(msg.partition < 8);
        assert_eq!(msg.partition, msg.partition_key.partition_number(8));
    }

    #[test]
    fn test_message_subject() {
        let msg = Message::new(event(EventKind::BatchCompleted), 1);
        assert_eq!(msg.subject("treasury.tx"), "treasury.tx.batch_completed.0");
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::new(event(EventKind::Confirmed), 4);
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
