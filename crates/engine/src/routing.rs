//! Shard routing
//!
//! A document lives on the shard selected by the xxh3 hash of its
//! lowercased id. Routing must never change for an existing database:
//! replay and cluster transactions rely on every node computing the same
//! owner for the same id.

use corvid_core::{DocumentId, PartitionId};
use xxhash_rust::xxh3::xxh3_64;

/// Shard owning `id` in a database with `shard_count` shards
pub fn shard_for(id: &DocumentId, shard_count: u32) -> PartitionId {
    if shard_count <= 1 {
        return PartitionId::FIRST;
    }
    let hash = xxh3_64(id.storage_key().as_bytes());
    PartitionId((hash % u64::from(shard_count)) as u32)
}
