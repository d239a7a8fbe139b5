//! Database engine for Corvid
//!
//! This crate wires the lower layers into hosted databases:
//! - Commands and their replayable envelopes, plus the registry that
//!   rebuilds commands from logged envelopes
//! - Partitions (one merger and one replay log per shard) and databases
//! - The cluster log, cluster transactions and the state machine that
//!   applies them on every node
//! - Index definition validation and the `corvid.toml` configuration file

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod command;
pub mod config;
pub mod context;
pub mod database;
pub mod envelope;
pub mod index;
pub mod node;
pub mod partition;
pub mod routing;

pub use cluster::{
    ClusterApplyOutcome, ClusterDocumentResult, ClusterLog, ClusterLogEntry, ClusterStateMachine,
    ClusterTransactionEnvelope, ClusterTransactionMergedCommand, ClusterTransactionOutcome,
    CompareExchangeGuard, DatabaseHost, SingleClusterDatabaseCommand,
};
pub use command::{
    BatchOperation, Command, CommandOutput, DeleteDocumentCommand, DocumentBatchCommand,
    PutDocumentCommand, PutIndexCommand,
};
pub use config::{CorvidConfig, CONFIG_FILE_NAME};
pub use context::PartitionContext;
pub use database::{Database, DatabaseRecord, LoadResult};
pub use envelope::{CommandEnvelope, EnvelopeBuilder, EnvelopeRegistry, ReplayableEnvelope};
pub use index::{validate_auto_index, IndexDefinition, IndexDeploymentMode};
pub use node::Node;
pub use partition::Partition;
pub use routing::shard_for;
