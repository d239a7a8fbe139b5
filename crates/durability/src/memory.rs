//! In-memory replay log.
//!
//! Used for `Cache` durability and as the stand-in consensus log. Entries
//! live as long as the value; `read_from` iterates a snapshot taken at call
//! time.

use crate::log::{LogCounters, LogEntry, LogError, LogIter, ReplayLog};
use parking_lot::RwLock;

/// Replay log kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryReplayLog {
    entries: RwLock<Vec<Vec<u8>>>,
}

impl MemoryReplayLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing was appended yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ReplayLog for MemoryReplayLog {
    fn append(&self, payload: &[u8]) -> Result<u64, LogError> {
        let mut entries = self.entries.write();
        entries.push(payload.to_vec());
        Ok(entries.len() as u64)
    }

    fn read_from(&self, from: u64) -> Result<LogIter<'_>, LogError> {
        let skip = from.saturating_sub(1) as usize;
        let snapshot: Vec<LogEntry> = self
            .entries
            .read()
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, payload)| LogEntry {
                position: i as u64 + 1,
                payload: payload.clone(),
            })
            .collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn last_position(&self) -> u64 {
        self.entries.read().len() as u64
    }

    fn flush(&self) -> Result<(), LogError> {
        Ok(())
    }

    fn counters(&self) -> LogCounters {
        let entries = self.entries.read();
        LogCounters {
            appends: entries.len() as u64,
            bytes_written: entries.iter().map(|e| e.len() as u64).sum(),
            ..LogCounters::default()
        }
    }
}
