//! Per-partition execution context
//!
//! Created when a partition opens and dropped when it closes. Every command
//! executed by the partition's merger (live or replayed) receives it; no
//! command reaches for global state.

use crate::routing::shard_for;
use corvid_core::{DatabaseName, DocumentId, PartitionId, PartitionKey};

/// What a command may know about the partition it runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionContext {
    key: PartitionKey,
    shard_count: u32,
}

impl PartitionContext {
    /// Context for shard `key` of a database with `shard_count` shards
    pub fn new(key: PartitionKey, shard_count: u32) -> Self {
        Self {
            key,
            shard_count: shard_count.max(1),
        }
    }

    /// Partition identity
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Owning database
    pub fn database(&self) -> &DatabaseName {
        &self.key.database
    }

    /// This partition's shard number
    pub fn partition(&self) -> PartitionId {
        self.key.partition
    }

    /// Number of shards of the owning database
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// True for databases with more than one shard
    pub fn is_sharded(&self) -> bool {
        self.shard_count > 1
    }

    /// True if `id` routes to this partition
    pub fn owns(&self, id: &DocumentId) -> bool {
        shard_for(id, self.shard_count) == self.key.partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_id_has_exactly_one_owner() {
        let db = DatabaseName::new("shop").unwrap();
        let shards: Vec<_> = (0..3)
            .map(|p| PartitionContext::new(PartitionKey::new(db.clone(), PartitionId(p)), 3))
            .collect();
        for i in 0..50 {
            let id = DocumentId::new(format!("orders/{}", i)).unwrap();
            assert_eq!(shards.iter().filter(|s| s.owns(&id)).count(), 1);
        }
    }

    #[test]
    fn test_unsharded_owns_everything() {
        let ctx = PartitionContext::new(
            PartitionKey::new(DatabaseName::new("shop").unwrap(), PartitionId::FIRST),
            1,
        );
        assert!(!ctx.is_sharded());
        assert!(ctx.owns(&DocumentId::new("anything").unwrap()));
    }
}
