//! Databases
//!
//! A database is a fixed set of shards. Single-document commands are
//! routed by id; client batches must stay on one shard (cross-shard
//! atomicity is what cluster transactions are for). Reads that inline
//! compare-exchange values take the compare-exchange read lock first and
//! read the documents under it, the same order commits use.

use crate::cluster::{
    result_key, ClusterTransactionMergedCommand, ClusterTransactionOutcome,
    SingleClusterDatabaseCommand,
};
use crate::command::{
    BatchOperation, Command, CommandOutput, DeleteDocumentCommand, DocumentBatchCommand,
    PutDocumentCommand, PutIndexCommand,
};
use crate::envelope::EnvelopeRegistry;
use crate::index::{validate_auto_index, IndexDefinition};
use crate::partition::Partition;
use crate::routing::shard_for;
use corvid_concurrency::MergerConfig;
use corvid_core::{
    CompareExchangeValue, ConcurrencyCheck, CorvidError, CorvidResult, DatabaseName, Document,
    DocumentId, PartitionId, PartitionKey,
};
use corvid_durability::{DurabilityMode, LogConfig, MemoryReplayLog, ReplayLog, SegmentedReplayLog};
use corvid_storage::CompareExchangeStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Record file name inside a database directory
pub const DATABASE_RECORD_FILE: &str = "database.toml";

/// Maximum shards per database
pub const MAX_SHARDS: u32 = 1024;

/// Persistent description of a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    /// Database name
    pub name: String,
    /// Number of shards (1 for unsharded)
    pub shard_count: u32,
}

impl DatabaseRecord {
    /// Validate the record
    pub fn validate(&self) -> CorvidResult<DatabaseName> {
        if self.shard_count == 0 || self.shard_count > MAX_SHARDS {
            return Err(CorvidError::invalid_input(format!(
                "database '{}': shard count must be between 1 and {}",
                self.name, MAX_SHARDS
            )));
        }
        DatabaseName::new(&self.name)
    }

    /// Read a record file
    pub fn from_file(path: &Path) -> CorvidResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let record: DatabaseRecord = toml::from_str(&content).map_err(|e| {
            CorvidError::corruption(format!(
                "Failed to parse database record '{}': {}",
                path.display(),
                e
            ))
        })?;
        record.validate()?;
        Ok(record)
    }

    /// Write a record file
    pub fn write_to_file(&self, path: &Path) -> CorvidResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CorvidError::internal(format!("Failed to serialize record: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Documents plus the compare-exchange values a read asked to inline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadResult {
    /// One slot per requested id, in request order
    pub documents: Vec<Option<Document>>,
    /// Included compare-exchange values by lowercased key (absent keys are omitted)
    pub compare_exchange: BTreeMap<String, CompareExchangeValue>,
}

/// Where and how a database keeps its partition logs
#[derive(Debug, Clone)]
pub(crate) struct StorageLayout<'a> {
    pub dir: Option<&'a Path>,
    pub durability: DurabilityMode,
    pub log_config: LogConfig,
    pub merger_config: MergerConfig,
}

/// An open database
pub struct Database {
    name: DatabaseName,
    partitions: Vec<Partition>,
    compare_exchange: Arc<CompareExchangeStore>,
}

impl Database {
    /// Open every shard, replaying their logs
    pub(crate) fn open(
        name: DatabaseName,
        shard_count: u32,
        layout: &StorageLayout<'_>,
        compare_exchange: Arc<CompareExchangeStore>,
        registry: &EnvelopeRegistry,
    ) -> CorvidResult<Self> {
        if shard_count == 0 || shard_count > MAX_SHARDS {
            return Err(CorvidError::invalid_input(format!(
                "database '{}': shard count must be between 1 and {}",
                name, MAX_SHARDS
            )));
        }
        let mut partitions = Vec::with_capacity(shard_count as usize);
        for shard in 0..shard_count {
            let key = PartitionKey::new(name.clone(), PartitionId(shard));
            let log: Arc<dyn ReplayLog> = match layout.dir {
                Some(dir) if layout.durability.requires_files() => Arc::new(SegmentedReplayLog::open(
                    dir.join(key.dir_name()),
                    layout.durability,
                    layout.log_config.clone(),
                )?),
                _ => Arc::new(MemoryReplayLog::new()),
            };
            partitions.push(Partition::open(
                key,
                shard_count,
                Arc::clone(&compare_exchange),
                log,
                registry,
                layout.merger_config.clone(),
            )?);
        }
        info!(target: "corvid::storage", database = %name, shards = shard_count, "Opened database");
        Ok(Self {
            name,
            partitions,
            compare_exchange,
        })
    }

    /// Database name
    pub fn name(&self) -> &DatabaseName {
        &self.name
    }

    /// Number of shards
    pub fn shard_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// True with more than one shard
    pub fn is_sharded(&self) -> bool {
        self.partitions.len() > 1
    }

    /// Every shard, in shard order
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Shard `id`
    pub fn partition(&self, id: PartitionId) -> CorvidResult<&Partition> {
        self.partitions.get(id.as_u32() as usize).ok_or_else(|| {
            CorvidError::invalid_input(format!("{} has no partition {}", self.name, id))
        })
    }

    /// Shard owning document `id`
    pub fn partition_for(&self, id: &DocumentId) -> &Partition {
        // shard_for is always below shard_count
        &self.partitions[shard_for(id, self.shard_count()).as_u32() as usize]
    }

    /// Put a document
    pub fn put(
        &self,
        id: DocumentId,
        body: serde_json::Value,
        concurrency: ConcurrencyCheck,
    ) -> CorvidResult<Document> {
        let partition = self.partition_for(&id);
        let command = Command::PutDocument(PutDocumentCommand::new(id, body, concurrency));
        match partition.submit(command)? {
            CommandOutput::Put(document) => Ok(document),
            other => Err(unexpected("PutDocument", &other)),
        }
    }

    /// Delete a document; returns the deleted document if it existed
    pub fn delete(
        &self,
        id: DocumentId,
        concurrency: ConcurrencyCheck,
    ) -> CorvidResult<Option<Document>> {
        let partition = self.partition_for(&id);
        let command = Command::DeleteDocument(DeleteDocumentCommand::new(id, concurrency));
        match partition.submit(command)? {
            CommandOutput::Deleted(document) => Ok(document),
            other => Err(unexpected("DeleteDocument", &other)),
        }
    }

    /// Apply a client batch atomically
    ///
    /// Every operation must route to the same shard.
    pub fn batch(&self, operations: Vec<BatchOperation>) -> CorvidResult<Vec<CommandOutput>> {
        let shards: BTreeSet<PartitionId> = operations
            .iter()
            .map(|op| shard_for(op.id(), self.shard_count()))
            .collect();
        let shard = match shards.len() {
            0 => return Err(CorvidError::invalid_input("empty batch")),
            1 => shards.into_iter().next().unwrap_or(PartitionId::FIRST),
            n => {
                return Err(CorvidError::not_supported(format!(
                    "batch spans {} shards of {}; use a cluster transaction",
                    n, self.name
                )))
            }
        };
        match self
            .partition(shard)?
            .submit(Command::DocumentBatch(DocumentBatchCommand::new(operations)))?
        {
            CommandOutput::Batch(results) => Ok(results),
            other => Err(unexpected("DocumentBatch", &other)),
        }
    }

    /// Store an index definition on every shard
    pub fn put_index(&self, definition: IndexDefinition) -> CorvidResult<()> {
        validate_auto_index(&definition, self.is_sharded())?;
        for partition in &self.partitions {
            partition.submit(Command::PutIndex(PutIndexCommand::new(definition.clone())))?;
        }
        Ok(())
    }

    /// Stored index definition
    pub fn index(&self, name: &str) -> CorvidResult<Option<IndexDefinition>> {
        let key = IndexDefinition::new(name, Vec::new()).metadata_key();
        match self.partitions[0].store().metadata(&key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Committed document
    pub fn load(&self, id: &DocumentId) -> Option<Document> {
        self.partition_for(id).get(id)
    }

    /// Load documents and inline compare-exchange values from one point in time
    ///
    /// The compare-exchange read lock is held for the whole read, and every
    /// commit that touches the table takes its write lock before the
    /// partition's. A document written together with a compare-exchange
    /// change on the same shard is therefore never seen without it, or
    /// the other way round.
    ///
    /// Shards are read one after another. A cluster transaction spanning
    /// several shards commits shard by shard in shard order, and only the
    /// first shard commits the table changes; a read may see its documents
    /// on the first shard and not yet on later ones.
    pub fn load_with_includes<S: AsRef<str>>(
        &self,
        ids: &[DocumentId],
        compare_exchange_keys: &[S],
    ) -> LoadResult {
        self.compare_exchange.with_read(|table| LoadResult {
            compare_exchange: table.include_values(&self.name, compare_exchange_keys),
            documents: ids
                .iter()
                .map(|id| self.partition_for(id).store().with_read(|s| s.get(id).cloned()))
                .collect(),
        })
    }

    /// Apply the cluster transaction decided at `raft_index` on every affected shard
    ///
    /// Shards run one after another in shard order; the first records the
    /// decision the others reuse. Shards that already hold a result for
    /// `raft_index` answer from it without logging anything.
    pub(crate) fn apply_cluster_transaction(
        &self,
        raft_index: u64,
        commands: &[SingleClusterDatabaseCommand],
    ) -> CorvidResult<ClusterTransactionOutcome> {
        let mut shards: BTreeSet<PartitionId> = commands
            .iter()
            .filter_map(|c| c.document_id())
            .map(|id| shard_for(id, self.shard_count()))
            .collect();
        if shards.is_empty() {
            shards.insert(PartitionId::FIRST);
        }

        let mut outcomes = Vec::with_capacity(shards.len());
        for shard in shards {
            let partition = self.partition(shard)?;
            if let Some(recorded) = partition.store().metadata(&result_key(raft_index)) {
                outcomes.push(serde_json::from_value(recorded)?);
                continue;
            }
            let command = ClusterTransactionMergedCommand::new(
                raft_index,
                self.name.clone(),
                commands.to_vec(),
            );
            match partition.submit_decided(Command::ClusterTransaction(command))? {
                CommandOutput::Cluster(outcome) => outcomes.push(outcome),
                other => return Err(unexpected("ClusterTransaction", &other)),
            }
        }
        Ok(ClusterTransactionOutcome::merge(raft_index, outcomes))
    }

    /// Drain every merger and flush logs
    pub fn close(&self) {
        for partition in &self.partitions {
            partition.close();
        }
    }
}

fn unexpected(kind: &str, output: &CommandOutput) -> CorvidError {
    CorvidError::internal(format!("{} produced unexpected output {:?}", kind, output))
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("partitions", &self.partitions)
            .finish()
    }
}
