//! Error types for Corvid
//!
//! This module defines the error taxonomy shared by every layer of the
//! engine. We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! ## Error Classes
//!
//! Every error belongs to exactly one [`ErrorClass`]. The transaction merger
//! consults the class to decide how far a failure reaches:
//!
//! | Class | Scope | Merger reaction |
//! |-------|-------|-----------------|
//! | `CommandLevel` | One command | Roll back to the command's savepoint, keep the batch |
//! | `TransactionFatal` | Whole batch | Discard the storage transaction, fail every command in it |
//! | `Replay` | Recovery | Halt recovery, surface to the operator |
//! | `Lifecycle` | Submission | Command never entered a batch (queue full, closed, canceled, timed out) |
//!
//! `CorvidError` is `Clone` so a single fatal error can be delivered to
//! every pending command of an aborted batch.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for Corvid operations
pub type CorvidResult<T> = std::result::Result<T, CorvidError>;

/// Reach of a failure, used by the merger to isolate or abort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Local to one command; sibling commands still commit
    CommandLevel,
    /// Aborts the whole in-flight batch
    TransactionFatal,
    /// Replay or data-format failure; recovery must halt
    Replay,
    /// The command never reached a batch (or its outcome is unknown)
    Lifecycle,
}

/// Error types for the Corvid engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CorvidError {
    // ==================== Command-level ====================
    /// Uniqueness or other constraint violation
    #[error("constraint violation: {reason}")]
    ConstraintViolation {
        /// What was violated
        reason: String,
    },

    /// Optimistic concurrency check failed on a document
    #[error("concurrency violation on '{id}': expected etag {expected}, actual {actual}")]
    ConcurrencyViolation {
        /// Document id
        id: String,
        /// Etag the caller expected
        expected: u64,
        /// Etag found in storage (0 when the document is absent)
        actual: u64,
    },

    /// Compare-exchange expected index did not match the stored index
    #[error("compare-exchange mismatch on '{key}': expected index {expected}, actual {actual}")]
    CompareExchangeMismatch {
        /// Compare-exchange key
        key: String,
        /// Index the caller expected
        expected: u64,
        /// Index stored at apply time
        actual: u64,
    },

    /// Document does not exist
    #[error("document not found: {id}")]
    DocumentNotFound {
        /// Document id
        id: String,
    },

    /// Database does not exist on this node
    #[error("database not found: {name}")]
    DatabaseNotFound {
        /// Database name
        name: String,
    },

    /// Invalid caller input
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Why the input was rejected
        reason: String,
    },

    /// Operation is not supported in this configuration
    #[error("not supported: {reason}")]
    NotSupported {
        /// What is not supported
        reason: String,
    },

    // ==================== Transaction-fatal ====================
    /// A resource ran out while a batch was executing or being logged
    #[error("resource exhausted: {resource}: {reason}")]
    ResourceExhausted {
        /// Name of the resource
        resource: String,
        /// Detail
        reason: String,
    },

    /// Storage corruption detected
    #[error("data corruption: {message}")]
    Corruption {
        /// Description of the corruption
        message: String,
    },

    /// I/O error (log append, fsync)
    #[error("I/O error: {reason}")]
    Io {
        /// I/O error kind
        kind: IoErrorKind,
        /// Detail
        reason: String,
    },

    /// Storage engine failure that leaves the transaction unusable
    #[error("storage error: {message}")]
    Storage {
        /// Detail
        message: String,
    },

    /// Invariant violation inside the engine
    #[error("internal error: {message}")]
    Internal {
        /// Detail
        message: String,
    },

    // ==================== Replay / format ====================
    /// Log contains a command kind with no registered envelope
    #[error("unknown command kind '{tag}'")]
    UnknownCommandKind {
        /// The unrecognized kind tag
        tag: String,
    },

    /// Envelope could not be decoded or rebuilt
    #[error("malformed envelope ({tag}): {reason}")]
    MalformedEnvelope {
        /// Kind tag of the envelope
        tag: String,
        /// Detail
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {reason}")]
    Serialization {
        /// Detail
        reason: String,
    },

    /// A logged command failed when replayed against the state it originally saw
    #[error("replay diverged at log position {position}: {reason}")]
    ReplayDiverged {
        /// Log position of the batch
        position: u64,
        /// Detail
        reason: String,
    },

    // ==================== Lifecycle ====================
    /// Submission refused because a bounded queue is full; nothing ran
    #[error("backpressure: {resource}: {reason}")]
    Backpressure {
        /// Name of the queue
        resource: String,
        /// Detail
        reason: String,
    },

    /// The merger no longer accepts commands
    #[error("transaction merger for {partition} is closed")]
    MergerClosed {
        /// Partition description
        partition: String,
    },

    /// Command was canceled before it entered a batch
    #[error("command canceled before execution")]
    Canceled,

    /// Caller stopped waiting; the command may or may not have committed
    #[error("outcome unknown after waiting {waited_ms}ms; the command may still commit")]
    OutcomeUnknown {
        /// How long the caller waited
        waited_ms: u64,
    },
}

/// Cloneable mirror of `std::io::ErrorKind` for the kinds we classify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoErrorKind {
    /// Device or quota full
    StorageFull,
    /// Data on disk is invalid
    InvalidData,
    /// Unexpected end of file
    UnexpectedEof,
    /// Permission denied
    PermissionDenied,
    /// File missing
    NotFound,
    /// Anything else
    Other,
}

impl From<io::ErrorKind> for IoErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::InvalidData => IoErrorKind::InvalidData,
            io::ErrorKind::UnexpectedEof => IoErrorKind::UnexpectedEof,
            io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            io::ErrorKind::NotFound => IoErrorKind::NotFound,
            // ENOSPC surfaces as Other on older toolchains
            _ => IoErrorKind::Other,
        }
    }
}

impl From<io::Error> for CorvidError {
    fn from(e: io::Error) -> Self {
        let kind = if e.raw_os_error() == Some(28) {
            IoErrorKind::StorageFull
        } else {
            IoErrorKind::from(e.kind())
        };
        CorvidError::Io {
            kind,
            reason: e.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for CorvidError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CorvidError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for CorvidError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CorvidError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for CorvidError {
    fn from(e: serde_json::Error) -> Self {
        CorvidError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl CorvidError {
    /// Classify this error
    ///
    /// This is the single table deciding whether a failure stays local to
    /// one command or aborts the batch. Serialization failures are fatal
    /// while a batch is being executed (the batch cannot be logged) and are
    /// replay failures during recovery; the merger only ever sees the former.
    pub fn class(&self) -> ErrorClass {
        match self {
            CorvidError::ConstraintViolation { .. }
            | CorvidError::ConcurrencyViolation { .. }
            | CorvidError::CompareExchangeMismatch { .. }
            | CorvidError::DocumentNotFound { .. }
            | CorvidError::DatabaseNotFound { .. }
            | CorvidError::InvalidInput { .. }
            | CorvidError::NotSupported { .. } => ErrorClass::CommandLevel,

            CorvidError::ResourceExhausted { .. }
            | CorvidError::Corruption { .. }
            | CorvidError::Io { .. }
            | CorvidError::Storage { .. }
            | CorvidError::Internal { .. }
            | CorvidError::Serialization { .. } => ErrorClass::TransactionFatal,

            CorvidError::UnknownCommandKind { .. }
            | CorvidError::MalformedEnvelope { .. }
            | CorvidError::ReplayDiverged { .. } => ErrorClass::Replay,

            CorvidError::Backpressure { .. }
            | CorvidError::MergerClosed { .. }
            | CorvidError::Canceled
            | CorvidError::OutcomeUnknown { .. } => ErrorClass::Lifecycle,
        }
    }

    /// True if this error must abort the whole in-flight batch
    ///
    /// Replay-class errors raised while executing a batch (a command whose
    /// envelope cannot be produced) are fatal too: the batch cannot be
    /// recorded faithfully.
    pub fn is_transaction_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransactionFatal | ErrorClass::Replay
        )
    }

    /// Create an InvalidInput error
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        CorvidError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Create a ConstraintViolation error
    pub fn constraint(reason: impl Into<String>) -> Self {
        CorvidError::ConstraintViolation {
            reason: reason.into(),
        }
    }

    /// Create a NotSupported error
    pub fn not_supported(reason: impl Into<String>) -> Self {
        CorvidError::NotSupported {
            reason: reason.into(),
        }
    }

    /// Create a Corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        CorvidError::Corruption {
            message: message.into(),
        }
    }

    /// Create a Storage error
    pub fn storage(message: impl Into<String>) -> Self {
        CorvidError::Storage {
            message: message.into(),
        }
    }

    /// Create an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        CorvidError::Internal {
            message: message.into(),
        }
    }

    /// Create a MalformedEnvelope error
    pub fn malformed(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        CorvidError::MalformedEnvelope {
            tag: tag.into(),
            reason: reason.into(),
        }
    }
}
