//! Transaction merging for Corvid
//!
//! This crate batches independently submitted commands into shared storage
//! transactions:
//! - TransactionMerger: per-partition single-writer batching executor
//! - MergedCommand: what the merger needs from a command
//! - PendingResult: caller-side handle, delivered after the batch is durable
//! - LoggedBatch: the replay-log record of one committed batch
//! - replay_partition: rebuild a partition from its replay log
//!
//! A command's result is never delivered before the batch containing it
//! has been appended to the partition's replay log and published.

#![warn(missing_docs)]

pub mod command;
pub mod completion;
pub mod config;
pub mod merger;
pub mod replay;
pub mod stats;

pub use command::{LoggedBatch, MergedCommand, LOGGED_BATCH_VERSION};
pub use completion::PendingResult;
pub use config::{MergerConfig, MergerConfigError};
pub use merger::TransactionMerger;
pub use replay::{replay_partition, ReplayStats};
pub use stats::MergerStatsSnapshot;
