//! Partition lifecycle
//!
//! A partition (shard) owns its document store, its replay log, its
//! execution context and the merger thread that is its only writer.
//! Opening a partition replays its log through the envelope registry
//! before the merger accepts new commands.

use crate::command::{Command, CommandOutput};
use crate::context::PartitionContext;
use crate::envelope::EnvelopeRegistry;
use corvid_concurrency::{
    replay_partition, MergerConfig, MergerStatsSnapshot, PendingResult, ReplayStats,
    TransactionMerger,
};
use corvid_core::{CorvidResult, Document, DocumentId, PartitionKey};
use corvid_durability::ReplayLog;
use corvid_storage::{CompareExchangeStore, PartitionStore};
use std::sync::Arc;
use tracing::{info, warn};

/// One open shard
pub struct Partition {
    context: Arc<PartitionContext>,
    store: Arc<PartitionStore>,
    log: Arc<dyn ReplayLog>,
    merger: TransactionMerger<Command>,
    recovered: ReplayStats,
}

impl Partition {
    /// Open shard `key` of a database with `shard_count` shards
    ///
    /// Replays `log` into a fresh store, then starts the merger. Replay
    /// failures are returned and the partition is not opened.
    pub fn open(
        key: PartitionKey,
        shard_count: u32,
        compare_exchange: Arc<CompareExchangeStore>,
        log: Arc<dyn ReplayLog>,
        registry: &EnvelopeRegistry,
        config: MergerConfig,
    ) -> CorvidResult<Self> {
        let context = Arc::new(PartitionContext::new(key.clone(), shard_count));
        let store = Arc::new(PartitionStore::new(key.clone()));

        let recovered = replay_partition::<Command, _>(
            &store,
            &compare_exchange,
            log.as_ref(),
            context.as_ref(),
            |envelope| registry.to_command(&envelope, &context, &key.database),
        )?;

        let merger = TransactionMerger::start(
            Arc::clone(&store),
            compare_exchange,
            Arc::clone(&log),
            Arc::clone(&context),
            config,
        )?;

        info!(
            target: "corvid::storage",
            partition = %key,
            documents = store.len(),
            batches = recovered.batches,
            "Opened partition"
        );

        Ok(Self {
            context,
            store,
            log,
            merger,
            recovered,
        })
    }

    /// Partition identity
    pub fn key(&self) -> &PartitionKey {
        self.context.key()
    }

    /// Execution context handed to every command
    pub fn context(&self) -> &PartitionContext {
        &self.context
    }

    /// Committed document store
    pub fn store(&self) -> &Arc<PartitionStore> {
        &self.store
    }

    /// What was replayed when the partition opened
    pub fn recovered(&self) -> ReplayStats {
        self.recovered
    }

    /// Position of the last logged batch
    pub fn log_position(&self) -> u64 {
        self.log.last_position()
    }

    /// Committed document
    pub fn get(&self, id: &DocumentId) -> Option<Document> {
        self.store.get(id)
    }

    /// Submit a command and wait for its batch
    pub fn submit(&self, command: Command) -> CorvidResult<CommandOutput> {
        self.merger.submit(command)
    }

    /// Submit a command decided by the cluster log and wait for its batch
    ///
    /// Not subject to the queue bound.
    pub fn submit_decided(&self, command: Command) -> CorvidResult<CommandOutput> {
        self.merger.enqueue_decided(command)?.wait()
    }

    /// Submit a command without waiting
    pub fn enqueue(&self, command: Command) -> CorvidResult<PendingResult<CommandOutput>> {
        self.merger.enqueue(command)
    }

    /// Merger counters
    pub fn stats(&self) -> MergerStatsSnapshot {
        self.merger.stats()
    }

    /// Drain the merger and flush the log
    pub fn close(&self) {
        self.merger.close();
        if let Err(e) = self.log.flush() {
            warn!(target: "corvid::storage", partition = %self.key(), error = %e, "Log flush failed on close");
        }
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("key", self.key())
            .field("documents", &self.store.len())
            .field("log_position", &self.log_position())
            .finish()
    }
}
