use gather_protocol::ShardFailureRecord;
use gather_protocol::ShardId;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;

/// Terminal shard failures of one request, at most one per shard. A later
/// record for the same shard replaces the earlier one.
#[derive(Debug, Default)]
pub struct ShardFailureSet {
    records: Mutex<BTreeMap<ShardId, ShardFailureRecord>>,
}

impl ShardFailureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ShardFailureRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.shard_id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, shard_id: &ShardId) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(shard_id)
    }

    /// Records ordered by shard id.
    pub fn snapshot(&self) -> Vec<ShardFailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
