//! Partition replay
//!
//! Rebuilds a partition from its replay log by re-executing every logged
//! batch in its own storage transaction, in log order. Each command sees
//! exactly the state it saw when it first ran, so any failure here means
//! the log and the code disagree: replay stops with `ReplayDiverged`
//! rather than skipping the command.

use crate::command::{LoggedBatch, MergedCommand};
use corvid_core::{CorvidError, CorvidResult};
use corvid_durability::ReplayLog;
use corvid_storage::{CompareExchangeStore, PartitionStore, StorageTransaction};
use tracing::{error, info};

/// Summary of a completed replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Batches re-applied
    pub batches: u64,
    /// Commands re-executed
    pub commands: u64,
    /// Position of the last replayed batch (0 for an empty log)
    pub last_position: u64,
}

/// Re-apply a partition's replay log
///
/// `rebuild` turns a logged envelope back into an executable command. The
/// partition is expected to be empty; the log is not appended to.
pub fn replay_partition<C, F>(
    partition: &PartitionStore,
    compare_exchange: &CompareExchangeStore,
    log: &dyn ReplayLog,
    context: &C::Context,
    mut rebuild: F,
) -> CorvidResult<ReplayStats>
where
    C: MergedCommand,
    F: FnMut(C::Envelope) -> CorvidResult<C>,
{
    let key = partition.key();
    let mut stats = ReplayStats::default();

    for entry in log.read_from(1)? {
        let entry = entry?;
        let position = entry.position;
        let diverged = |reason: String| {
            error!(target: "corvid::replay", partition = %key, position, %reason, "Replay diverged");
            CorvidError::ReplayDiverged { position, reason }
        };

        let batch = LoggedBatch::<C::Envelope>::from_bytes(&entry.payload)?;
        if &batch.partition != key {
            return Err(diverged(format!(
                "batch belongs to partition {}",
                batch.partition
            )));
        }

        let mut txn = StorageTransaction::begin(partition, compare_exchange);
        for envelope in batch.commands {
            let mut command = rebuild(envelope)?;
            command
                .execute(context, &mut txn)
                .map_err(|e| diverged(format!("{} failed: {}", command.kind(), e)))?;
            stats.commands += 1;
        }
        txn.commit()?;

        stats.batches += 1;
        stats.last_position = position;
    }

    info!(
        target: "corvid::replay",
        partition = %key,
        batches = stats.batches,
        commands = stats.commands,
        last_position = stats.last_position,
        "Replayed partition log"
    );
    Ok(stats)
}
