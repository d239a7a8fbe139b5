//! Cluster-wide coordination
//!
//! - [`ClusterLog`]: ordered log of decided entries; positions are raft indexes
//! - [`ClusterStateMachine`]: applies entries to the compare-exchange table
//!   and the hosted databases
//! - [`ClusterTransactionMergedCommand`]: one shard's part of a cluster
//!   transaction, executed by that shard's merger

mod command;
mod log;
mod state_machine;

pub use command::{
    decide, evaluate_guards, result_key, validate_transaction, ClusterDocumentResult,
    ClusterTransactionEnvelope, ClusterTransactionMergedCommand, ClusterTransactionOutcome,
    CompareExchangeGuard, SingleClusterDatabaseCommand, LAST_INDEX_KEY,
};
pub use log::{ClusterLog, ClusterLogEntry};
pub use state_machine::{ClusterApplyOutcome, ClusterStateMachine, DatabaseHost};
