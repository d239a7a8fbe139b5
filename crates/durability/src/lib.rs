//! Durability layer for Corvid
//!
//! This crate provides the replay logs that make merged batches durable:
//! - ReplayLog: append-only log trait (positions contiguous from 1)
//! - SegmentedReplayLog: file-backed log with CRC-framed records
//! - MemoryReplayLog: in-memory log for cache mode and the consensus stand-in
//! - DurabilityMode: Cache, Always, Standard fsync policies
//! - StorageCodec: encoding seam applied to every persisted payload
//!
//! A batch is durable once `append` returns; recovery replays the log from
//! position 1 (or a later checkpoint) into a fresh store.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod format;
pub mod log;
pub mod memory;
pub mod mode;
pub mod segmented;

pub use codec::{get_codec, CodecError, IdentityCodec, StorageCodec};
pub use config::{LogConfig, LogConfigError};
pub use format::{LogRecord, LogRecordError, LogSegment, SegmentHeader};
pub use log::{LogCounters, LogEntry, LogError, LogIter, ReplayLog};
pub use memory::MemoryReplayLog;
pub use mode::DurabilityMode;
pub use segmented::SegmentedReplayLog;
