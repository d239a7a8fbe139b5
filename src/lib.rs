//! Corvid - sharded document store with batched transaction merging
//!
//! Every shard of a database has one writer: a transaction merger that
//! folds many independent commands into one storage transaction and one
//! replay log record. Cluster-wide coordination goes through a
//! compare-exchange table driven by a consensus log.
//!
//! # Quick Start
//!
//! ```ignore
//! use corvid::{ClusterLog, ConcurrencyCheck, DocumentId, Node};
//! use std::sync::Arc;
//!
//! let node = Node::ephemeral(Arc::new(ClusterLog::in_memory()))?;
//! let shop = node.create_database("shop", 3)?;
//! shop.put(DocumentId::new("users/1")?, serde_json::json!({"name": "Ada"}), ConcurrencyCheck::None)?;
//!
//! // Reserve a unique email cluster-wide
//! node.put_compare_exchange("shop", "emails/ada@example.com", 0, "users/1".into())?;
//! ```
//!
//! # Architecture
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `corvid-core` | identifiers, documents, compare-exchange values, errors |
//! | `corvid-storage` | partition store, compare-exchange store, storage transactions |
//! | `corvid-durability` | replay logs and durability modes |
//! | `corvid-concurrency` | transaction merger and partition replay |
//! | `corvid-engine` | commands, envelopes, databases, nodes, cluster log |

pub use corvid_concurrency::{MergerConfig, MergerStatsSnapshot, PendingResult, ReplayStats};
pub use corvid_core::{
    ClusterDecision, CompareExchangeConflict, CompareExchangeKey, CompareExchangeResult,
    CompareExchangeValue, ConcurrencyCheck, CorvidError, CorvidResult, DatabaseName, Document,
    DocumentId, ErrorClass, PartitionId, PartitionKey,
};
pub use corvid_durability::{DurabilityMode, LogConfig};
pub use corvid_storage::{CompareExchangeState, CompareExchangeStore, PartitionState};
pub use corvid_engine::*;
