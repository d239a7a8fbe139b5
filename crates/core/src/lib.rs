//! Core types for Corvid
//!
//! This crate defines the foundational types used throughout the system:
//! - DatabaseName, PartitionId, PartitionKey: tenant and shard identity
//! - DocumentId, Document, ConcurrencyCheck: document model
//! - CompareExchangeKey, CompareExchangeValue, CompareExchangeResult:
//!   the cluster-wide coordination primitive's value types
//! - CorvidError, ErrorClass: error taxonomy and its classification table

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compare_exchange;
pub mod document;
pub mod error;
pub mod types;

pub use compare_exchange::{
    ClusterDecision, CompareExchangeConflict, CompareExchangeKey, CompareExchangeResult,
    CompareExchangeValue,
};
pub use document::{ConcurrencyCheck, Document};
pub use error::{CorvidError, CorvidResult, ErrorClass, IoErrorKind};
pub use types::{DatabaseName, DocumentId, PartitionId, PartitionKey};
