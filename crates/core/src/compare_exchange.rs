//! Compare-exchange value types
//!
//! A compare-exchange entry is a key, an opaque JSON value, and the
//! consensus log index of its last successful change. The index is the only
//! version: a write succeeds iff the caller's expected index equals it.
//! Index 0 means "the key does not exist".

use crate::types::DatabaseName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Database-scoped compare-exchange key
///
/// Keys are compared case-insensitively within a database; different
/// databases never see each other's keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompareExchangeKey {
    /// Owning database
    pub database: DatabaseName,
    /// Lowercased key
    pub key: String,
}

impl CompareExchangeKey {
    /// Create a scoped key
    pub fn new(database: DatabaseName, key: impl AsRef<str>) -> Self {
        Self {
            database,
            key: key.as_ref().to_lowercase(),
        }
    }
}

impl fmt::Display for CompareExchangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.key)
    }
}

/// Stored compare-exchange entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareExchangeValue {
    /// Key (lowercased, without the database scope)
    pub key: String,
    /// Log index of the last successful change
    pub index: u64,
    /// Current value
    pub value: serde_json::Value,
}

/// Outcome of a compare-exchange attempt
///
/// On failure, `index` and `value` describe the winner the caller lost to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareExchangeResult {
    /// Whether the write was applied
    pub successful: bool,
    /// Stored index after the attempt (0 when the key does not exist)
    pub index: u64,
    /// Stored value after the attempt
    pub value: Option<serde_json::Value>,
}

/// A failed guard inside a cluster transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareExchangeConflict {
    /// Key of the failed guard
    pub key: String,
    /// Index the transaction expected
    pub expected: u64,
    /// Index stored at apply time
    pub actual: u64,
}

/// Outcome of evaluating a cluster transaction's guards
///
/// Recorded once per consensus index so that every shard, every replay and
/// every redelivery of the same transaction reaches the same verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterDecision {
    /// Every guard matched; the transaction's effects were applied
    Committed,
    /// At least one guard failed; nothing was applied
    Rejected {
        /// Every failed guard, in command order
        conflicts: Vec<CompareExchangeConflict>,
    },
}

impl ClusterDecision {
    /// True for `Committed`
    pub fn is_committed(&self) -> bool {
        matches!(self, ClusterDecision::Committed)
    }
}
