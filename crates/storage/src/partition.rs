//! Partition document store
//!
//! One store per partition (shard). Holds the committed documents, a small
//! metadata table used by the engine (identity counters, index definitions,
//! cluster bookkeeping) and the partition etag counter.
//!
//! Writes only happen through [`StorageTransaction::commit`]; the partition
//! merger is the single writer. Readers take the read lock briefly and see
//! whole committed batches only.
//!
//! [`StorageTransaction::commit`]: crate::StorageTransaction::commit

use corvid_core::{Document, DocumentId, PartitionKey};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Committed state of one partition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionState {
    pub(crate) documents: BTreeMap<String, Document>,
    pub(crate) metadata: BTreeMap<String, serde_json::Value>,
    pub(crate) last_etag: u64,
}

impl PartitionState {
    /// Document by id (case-insensitive)
    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(&id.storage_key())
    }

    /// Metadata value
    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Highest etag assigned so far
    pub fn last_etag(&self) -> u64 {
        self.last_etag
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// True if the partition holds no documents
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Documents in storage-key order
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// Metadata entries whose key starts with `prefix`
    pub fn metadata_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a serde_json::Value)> + 'a {
        self.metadata
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }
}

/// Document store of one partition
#[derive(Debug)]
pub struct PartitionStore {
    key: PartitionKey,
    pub(crate) state: RwLock<PartitionState>,
}

impl PartitionStore {
    /// Create an empty partition
    pub fn new(key: PartitionKey) -> Self {
        Self {
            key,
            state: RwLock::new(PartitionState::default()),
        }
    }

    /// Partition identity
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Committed document by id
    pub fn get(&self, id: &DocumentId) -> Option<Document> {
        self.state.read().get(id).cloned()
    }

    /// Committed metadata value
    pub fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.state.read().metadata(key).cloned()
    }

    /// Highest committed etag
    pub fn last_etag(&self) -> u64 {
        self.state.read().last_etag
    }

    /// Number of committed documents
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// True if no document is committed
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Run `f` against the committed state under the read lock
    pub fn with_read<R>(&self, f: impl FnOnce(&PartitionState) -> R) -> R {
        f(&self.state.read())
    }

    /// Copy of the committed state
    pub fn snapshot(&self) -> PartitionState {
        self.state.read().clone()
    }
}
