//! Storage layer for Corvid
//!
//! This crate implements the in-memory state the merger writes to:
//! - PartitionStore: committed documents, metadata and etag counter of one shard
//! - CompareExchangeStore: the node-wide compare-exchange table and the
//!   recorded cluster transaction decisions
//! - StorageTransaction: buffered writes with savepoints, published atomically
//!
//! Durability is not handled here: committed state is rebuilt from the
//! replay logs on restart.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compare_exchange;
pub mod partition;
pub mod transaction;

pub use compare_exchange::{
    try_compare_exchange, try_delete_compare_exchange, CompareExchangeBatch,
    CompareExchangeState, CompareExchangeStore, CompareExchangeView,
    DEFAULT_DECISION_RETENTION,
};
pub use partition::{PartitionState, PartitionStore};
pub use transaction::{CommitInfo, Savepoint, StorageTransaction};
