//! Partitioning of event subjects

use batch_engine::events::LifecycleEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Partition key for routing events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionKey {
    /// Partition by owning enterprise
    Enterprise(Uuid),
    /// Partition by batch (batch-level events)
    Batch(Uuid),
    /// No routing information
    Broadcast,
}

impl PartitionKey {
    /// Enterprise when known, otherwise the batch
    pub fn for_event(event: &LifecycleEvent) -> Self {
        match (event.enterprise_id, event.batch_id) {
            (Some(enterprise_id), _) => PartitionKey::Enterprise(enterprise_id),
            (None, Some(batch_id)) => PartitionKey::Batch(batch_id),
            (None, None) => PartitionKey::Broadcast,
        }
    }

    /// Compute partition number for load balancing
    pub fn partition_number(&self, num_partitions: u32) -> u32 {
        let hash = match self {
            PartitionKey::Enterprise(id) => blake3::hash(id.as_bytes()),
            PartitionKey::Batch(id) => blake3::hash(id.as_bytes()),
            PartitionKey::Broadcast => return 0,
        };

        let bytes = hash.as_bytes();
        let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        value % num_partitions.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_engine::events::EventKind;
    use chrono::Utc;

    fn event(enterprise_id: Option<Uuid>, batch_id: Option<Uuid>) -> LifecycleEvent {
        LifecycleEvent {
            event_id: Uuid::now_v7(),
            kind: EventKind::Enqueued,
            transaction_id: None,
            batch_id,
            enterprise_id,
            status: "queued".to_string(),
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_partition_key_for_event() {
        let enterprise = Uuid::new_v4();
        let batch = Uuid::new_v4();

        assert_eq!(
            PartitionKey::for_event(&event(Some(enterprise), Some(batch))),
            PartitionKey::Enterprise(enterprise)
        );
        assert_eq!(
            PartitionKey::for_event(&event(None, Some(batch))),
            PartitionKey::Batch(batch)
        );
        assert_eq!(
            PartitionKey::for_event(&event(None, None)),
            PartitionKey::Broadcast
        );
    }

    #[test]
    fn test_partition_number_is_stable() {
        let key = PartitionKey::Enterprise(Uuid::new_v4());
        let partition = key.partition_number(16);
        assert!(partition < 16);
        assert_eq!(partition, key.partition_number(16));

        assert_eq!(PartitionKey::Broadcast.partition_number(16), 0);
        assert_eq!(key.partition_number(0), 0);
    }
}
