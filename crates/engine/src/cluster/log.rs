//! Cluster log
//!
//! Stand-in for the consensus log: an ordered, durable sequence of
//! decided entries. Positions of the underlying [`ReplayLog`] are the raft
//! indexes. Leader election and replication are out of scope; several
//! nodes in one process share a `ClusterLog` to act as replicas.

use corvid_core::{CorvidError, CorvidResult, DatabaseName};
use corvid_durability::{DurabilityMode, LogConfig, MemoryReplayLog, ReplayLog, SegmentedReplayLog};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::command::SingleClusterDatabaseCommand;

/// A decided cluster log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterLogEntry {
    /// Standalone compare-exchange put
    CompareExchange {
        /// Database scope
        database: DatabaseName,
        /// Key
        key: String,
        /// Expected index (0: must not exist)
        expected_index: u64,
        /// New value
        value: serde_json::Value,
    },
    /// Standalone compare-exchange delete
    DeleteCompareExchange {
        /// Database scope
        database: DatabaseName,
        /// Key
        key: String,
        /// Expected index
        expected_index: u64,
    },
    /// Cluster transaction over one database
    ClusterTransaction {
        /// Target database
        database: DatabaseName,
        /// Ordered operations
        commands: Vec<SingleClusterDatabaseCommand>,
    },
}

impl ClusterLogEntry {
    /// Database the entry belongs to
    pub fn database(&self) -> &DatabaseName {
        match self {
            ClusterLogEntry::CompareExchange { database, .. }
            | ClusterLogEntry::DeleteCompareExchange { database, .. }
            | ClusterLogEntry::ClusterTransaction { database, .. } => database,
        }
    }

    fn to_bytes(&self) -> CorvidResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    fn from_bytes(index: u64, bytes: &[u8]) -> CorvidResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| {
            CorvidError::malformed("ClusterLogEntry", format!("index {}: {}", index, e))
        })
    }
}

/// Ordered log of decided cluster entries
pub struct ClusterLog {
    log: Arc<dyn ReplayLog>,
    last_index: Mutex<u64>,
    appended: Condvar,
}

impl ClusterLog {
    /// Wrap an existing replay log
    pub fn new(log: Arc<dyn ReplayLog>) -> Self {
        let last = log.last_position();
        Self {
            log,
            last_index: Mutex::new(last),
            appended: Condvar::new(),
        }
    }

    /// Volatile log
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryReplayLog::new()))
    }

    /// Durable log under `dir`
    pub fn open(dir: &Path, durability: DurabilityMode) -> CorvidResult<Self> {
        if !durability.requires_files() {
            return Ok(Self::in_memory());
        }
        let log = SegmentedReplayLog::open(dir, durability, LogConfig::default())?;
        Ok(Self::new(Arc::new(log)))
    }

    /// Append a decided entry and return its raft index
    ///
    /// The entry is synced before it becomes visible, whatever the
    /// durability mode: partition logs record results under raft indexes,
    /// so a shard must never hold a result for an index the cluster log
    /// could lose.
    pub fn propose(&self, entry: &ClusterLogEntry) -> CorvidResult<u64> {
        let bytes = entry.to_bytes()?;
        let mut last = self.last_index.lock();
        let index = self.log.append(&bytes)?;
        self.log.flush()?;
        *last = index;
        self.appended.notify_all();
        debug!(target: "corvid::cluster", index, database = %entry.database(), "Proposed entry");
        Ok(index)
    }

    /// Highest raft index appended
    pub fn last_index(&self) -> u64 {
        *self.last_index.lock()
    }

    /// Entries from `index` onwards, lazily decoded
    pub fn read_from(
        &self,
        index: u64,
    ) -> CorvidResult<impl Iterator<Item = CorvidResult<(u64, ClusterLogEntry)>> + '_> {
        let entries = self.log.read_from(index.max(1))?;
        Ok(entries.map(|entry| {
            let entry = entry?;
            let decoded = ClusterLogEntry::from_bytes(entry.position, &entry.payload)?;
            Ok((entry.position, decoded))
        }))
    }

    /// Block until `index` is appended or `timeout` elapses
    ///
    /// Returns true if the log reached `index`.
    pub fn wait_for(&self, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut last = self.last_index.lock();
        while *last < index {
            if self.appended.wait_until(&mut last, deadline).timed_out() {
                return *last >= index;
            }
        }
        true
    }

    /// Force appended entries to stable storage
    pub fn flush(&self) -> CorvidResult<()> {
        Ok(self.log.flush()?)
    }
}

impl std::fmt::Debug for ClusterLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLog")
            .field("last_index", &self.last_index())
            .finish()
    }
}
