//! Per-partition consumer positions
//!
//! Offsets here follow the Kafka convention: the committed position is the
//! offset of the *next* record to consume, i.e. last processed + 1.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: i32,
    /// Next offset to consume
    pub offset: i64,
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    processed: HashMap<(String, i32), i64>,
    committed: HashMap<(String, i32), i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the record at `offset` finished durably (processed or
    /// dead-lettered). Lower offsets than already seen are ignored.
    pub fn record_processed(&mut self, topic: &str, partition: i32, offset: i64) {
        let next = offset.saturating_add(1);
        let entry = self
            .processed
            .entry((topic.to_string(), partition))
            .or_insert(next);
        if next > *entry {
            *entry = next;
        }
    }

    /// Positions that are ahead of what was last committed
    pub fn pending_commits(&self) -> Vec<PartitionOffset> {
        let mut pending: Vec<PartitionOffset> = self
            .processed
            .iter()
            .filter(|(tp, next)| self.committed.get(*tp).map_or(true, |c| *next > c))
            .map(|((topic, partition), next)| PartitionOffset {
                topic: topic.clone(),
                partition: *partition,
                offset: *next,
            })
            .collect();
        pending.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        pending
    }

    /// Mark positions as committed. A position never moves backwards.
    pub fn mark_committed(&mut self, offsets: &[PartitionOffset]) {
        for po in offsets {
            let entry = self
                .committed
                .entry((po.topic.clone(), po.partition))
                .or_insert(po.offset);
            if po.offset > *entry {
                *entry = po.offset;
            }
        }
    }

    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.committed.get(&(topic.to_string(), partition)).copied()
    }

    /// Forget a partition after it was revoked from this consumer
    pub fn forget_partition(&mut self, topic: &str, partition: i32) {
        let key = (topic.to_string(), partition);
        self.processed.remove(&key);
        self.committed.remove(&key);
    }
}
