//! Document types
//!
//! A document is an id, a JSON body, and the partition etag assigned by the
//! write that produced it. Etags are allocated inside the storage
//! transaction, so replaying the same commands reproduces the same etags.

use crate::error::{CorvidError, CorvidResult};
use crate::types::DocumentId;
use serde::{Deserialize, Serialize};

/// A stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id (caller casing preserved)
    pub id: DocumentId,
    /// JSON body
    pub body: serde_json::Value,
    /// Partition etag of the last write
    pub etag: u64,
}

/// Optimistic concurrency requirement attached to a document write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConcurrencyCheck {
    /// No check (last writer wins)
    #[default]
    None,
    /// The document must not exist (uniqueness)
    MustNotExist,
    /// The document must exist with exactly this etag
    Etag(u64),
}

impl ConcurrencyCheck {
    /// Verify the check against the current etag (`None` when absent)
    pub fn verify(&self, id: &DocumentId, current: Option<u64>) -> CorvidResult<()> {
        match (self, current) {
            (ConcurrencyCheck::None, _) => Ok(()),
            (ConcurrencyCheck::MustNotExist, None) => Ok(()),
            (ConcurrencyCheck::MustNotExist, Some(_)) => Err(CorvidError::constraint(format!(
                "document '{}' already exists",
                id
            ))),
            (ConcurrencyCheck::Etag(expected), actual) if Some(*expected) == actual => Ok(()),
            (ConcurrencyCheck::Etag(expected), actual) => Err(CorvidError::ConcurrencyViolation {
                id: id.to_string(),
                expected: *expected,
                actual: actual.unwrap_or(0),
            }),
        }
    }
}
