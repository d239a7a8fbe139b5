//! Storage transaction with savepoints
//!
//! A [`StorageTransaction`] buffers every write of one merged batch in an
//! ordered write log plus read-your-writes overlays. Nothing is visible to
//! readers until [`StorageTransaction::commit`]; dropping the transaction
//! discards it.
//!
//! ## Savepoints
//!
//! The merger takes a [`Savepoint`] before each command. A command-level
//! failure rolls back to it: the write log is truncated, the overlays are
//! rebuilt from the surviving writes, and the etag counter is restored, so
//! the next command sees exactly the state it would have seen had the
//! failed command never run.
//!
//! ## Etags
//!
//! Etags come from a partition-wide counter allocated inside the
//! transaction. Replaying the same commands in the same order over the same
//! prior state allocates the same etags.

use crate::compare_exchange::{CompareExchangeStore, CompareExchangeView, CompareExchangeWrite};
use crate::partition::PartitionStore;
use corvid_core::{
    ClusterDecision, CompareExchangeKey, CompareExchangeValue, CorvidError, CorvidResult,
    Document, DocumentId,
};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
enum StagedWrite {
    PutDocument(Document),
    DeleteDocument(String),
    PutMetadata(String, serde_json::Value),
    DeleteMetadata(String),
    CompareExchange(CompareExchangeWrite),
}

/// Position in a transaction's write log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    writes: usize,
    next_etag: u64,
}

/// Summary of a committed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitInfo {
    /// Writes published
    pub writes: usize,
    /// Partition etag after commit
    pub last_etag: u64,
}

/// Buffered transaction over one partition and the node's compare-exchange table
pub struct StorageTransaction<'a> {
    partition: &'a PartitionStore,
    compare_exchange: &'a CompareExchangeStore,
    base_etag: u64,
    next_etag: u64,
    writes: Vec<StagedWrite>,
    documents: HashMap<String, Option<Document>>,
    metadata: HashMap<String, Option<serde_json::Value>>,
    cmpxchg: HashMap<CompareExchangeKey, Option<CompareExchangeValue>>,
    decisions: HashMap<u64, ClusterDecision>,
}

impl<'a> StorageTransaction<'a> {
    /// Open a transaction on top of the committed state
    pub fn begin(partition: &'a PartitionStore, compare_exchange: &'a CompareExchangeStore) -> Self {
        let base_etag = partition.last_etag();
        Self {
            partition,
            compare_exchange,
            base_etag,
            next_etag: base_etag + 1,
            writes: Vec::new(),
            documents: HashMap::new(),
            metadata: HashMap::new(),
            cmpxchg: HashMap::new(),
            decisions: HashMap::new(),
        }
    }

    /// Partition this transaction writes to
    pub fn partition(&self) -> &'a PartitionStore {
        self.partition
    }

    /// Read a document, staged writes included
    pub fn get_document(&self, id: &DocumentId) -> Option<Document> {
        match self.documents.get(&id.storage_key()) {
            Some(staged) => staged.clone(),
            None => self.partition.get(id),
        }
    }

    /// Current etag of a document, staged writes included
    pub fn document_etag(&self, id: &DocumentId) -> Option<u64> {
        self.get_document(id).map(|d| d.etag)
    }

    /// Stage a document write and return the stored document
    pub fn put_document(&mut self, id: DocumentId, body: serde_json::Value) -> Document {
        let document = Document {
            id,
            body,
            etag: self.next_etag,
        };
        self.next_etag += 1;
        trace!(target: "corvid::storage", id = %document.id, etag = document.etag, "Staged put");
        self.documents
            .insert(document.id.storage_key(), Some(document.clone()));
        self.writes.push(StagedWrite::PutDocument(document.clone()));
        document
    }

    /// Stage a delete; returns the previous document if there was one
    pub fn delete_document(&mut self, id: &DocumentId) -> Option<Document> {
        let previous = self.get_document(id)?;
        let key = id.storage_key();
        self.documents.insert(key.clone(), None);
        self.writes.push(StagedWrite::DeleteDocument(key));
        Some(previous)
    }

    /// Read a metadata value, staged writes included
    pub fn get_metadata(&self, key: &str) -> Option<serde_json::Value> {
        match self.metadata.get(key) {
            Some(staged) => staged.clone(),
            None => self.partition.metadata(key),
        }
    }

    /// Stage a metadata write
    pub fn put_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.metadata.insert(key.clone(), Some(value.clone()));
        self.writes.push(StagedWrite::PutMetadata(key, value));
    }

    /// Stage a metadata delete
    pub fn delete_metadata(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.metadata.insert(key.clone(), None);
        self.writes.push(StagedWrite::DeleteMetadata(key));
    }

    /// Etag the last staged document write received (committed etag if none)
    pub fn last_etag(&self) -> u64 {
        self.next_etag - 1
    }

    /// True if nothing is staged
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Mark the current position
    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            writes: self.writes.len(),
            next_etag: self.next_etag,
        }
    }

    /// Undo every write staged after `savepoint`
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        if savepoint.writes >= self.writes.len() && savepoint.next_etag == self.next_etag {
            return;
        }
        self.writes.truncate(savepoint.writes);
        self.next_etag = savepoint.next_etag;

        self.documents.clear();
        self.metadata.clear();
        self.cmpxchg.clear();
        self.decisions.clear();
        for write in &self.writes {
            match write {
                StagedWrite::PutDocument(doc) => {
                    self.documents.insert(doc.id.storage_key(), Some(doc.clone()));
                }
                StagedWrite::DeleteDocument(key) => {
                    self.documents.insert(key.clone(), None);
                }
                StagedWrite::PutMetadata(key, value) => {
                    self.metadata.insert(key.clone(), Some(value.clone()));
                }
                StagedWrite::DeleteMetadata(key) => {
                    self.metadata.insert(key.clone(), None);
                }
                StagedWrite::CompareExchange(CompareExchangeWrite::Put(key, value)) => {
                    self.cmpxchg.insert(key.clone(), Some(value.clone()));
                }
                StagedWrite::CompareExchange(CompareExchangeWrite::Delete(key)) => {
                    self.cmpxchg.insert(key.clone(), None);
                }
                StagedWrite::CompareExchange(CompareExchangeWrite::Decision(index, decision)) => {
                    self.decisions.insert(*index, decision.clone());
                }
            }
        }
    }

    /// Publish every staged write atomically
    ///
    /// Compare-exchange changes and documents become visible together:
    /// the compare-exchange lock is taken first, then the partition lock.
    pub fn commit(self) -> CorvidResult<CommitInfo> {
        let mut cmpxchg_writes = Vec::new();
        let mut partition_writes = Vec::with_capacity(self.writes.len());
        let mut consensus_index = 0;
        let total = self.writes.len();
        for write in self.writes {
            match write {
                StagedWrite::CompareExchange(w) => {
                    consensus_index = consensus_index.max(match &w {
                        CompareExchangeWrite::Put(_, v) => v.index,
                        CompareExchangeWrite::Delete(_) => 0,
                        CompareExchangeWrite::Decision(index, _) => *index,
                    });
                    cmpxchg_writes.push(w);
                }
                other => partition_writes.push(other),
            }
        }

        let mut cmpxchg_state = if cmpxchg_writes.is_empty() {
            None
        } else {
            Some(self.compare_exchange.state.write())
        };
        let mut state = self.partition.state.write();

        if state.last_etag != self.base_etag {
            return Err(CorvidError::internal(format!(
                "partition {} advanced from etag {} to {} under an open transaction",
                self.partition.key(),
                self.base_etag,
                state.last_etag
            )));
        }

        if let Some(cx) = cmpxchg_state.as_mut() {
            self.compare_exchange
                .apply_locked(cx, cmpxchg_writes, consensus_index);
        }

        for write in partition_writes {
            match write {
                StagedWrite::PutDocument(doc) => {
                    state.documents.insert(doc.id.storage_key(), doc);
                }
                StagedWrite::DeleteDocument(key) => {
                    state.documents.remove(&key);
                }
                StagedWrite::PutMetadata(key, value) => {
                    state.metadata.insert(key, value);
                }
                StagedWrite::DeleteMetadata(key) => {
                    state.metadata.remove(&key);
                }
                StagedWrite::CompareExchange(_) => {}
            }
        }
        state.last_etag = self.next_etag - 1;

        Ok(CommitInfo {
            writes: total,
            last_etag: state.last_etag,
        })
    }
}

impl CompareExchangeView for StorageTransaction<'_> {
    fn read_compare_exchange(&self, key: &CompareExchangeKey) -> Option<CompareExchangeValue> {
        match self.cmpxchg.get(key) {
            Some(staged) => staged.clone(),
            None => self.compare_exchange.get(key),
        }
    }

    fn stage_compare_exchange(
        &mut self,
        key: CompareExchangeKey,
        value: Option<CompareExchangeValue>,
    ) {
        self.cmpxchg.insert(key.clone(), value.clone());
        self.writes.push(StagedWrite::CompareExchange(match value {
            Some(v) => CompareExchangeWrite::Put(key, v),
            None => CompareExchangeWrite::Delete(key),
        }));
    }

    fn cluster_decision(&self, index: u64) -> Option<ClusterDecision> {
        self.decisions
            .get(&index)
            .cloned()
            .or_else(|| self.compare_exchange.decision(index))
    }

    fn record_cluster_decision(&mut self, index: u64, decision: ClusterDecision) {
        self.decisions.insert(index, decision.clone());
        self.writes.push(StagedWrite::CompareExchange(
            CompareExchangeWrite::Decision(index, decision),
        ));
    }

    fn last_applied_index(&self) -> u64 {
        self.compare_exchange.last_applied_index()
    }
}
