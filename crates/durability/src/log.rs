//! The replay log abstraction.
//!
//! A replay log is an append-only sequence of opaque payloads. Every
//! successful append returns a position; positions start at 1 and are
//! contiguous. Replay reads the entries back in order starting at any
//! position.
//!
//! Partitions use one log each for their merged batches; the cluster log
//! uses the same trait to stand in for the consensus log.

use crate::codec::CodecError;
use crate::config::LogConfigError;
use corvid_core::CorvidError;

/// One entry read back from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position assigned at append time
    pub position: u64,
    /// Payload as given to `append`
    pub payload: Vec<u8>,
}

/// Lazy iterator over log entries.
///
/// The iterator yields an error at most once and then ends.
pub type LogIter<'a> = Box<dyn Iterator<Item = Result<LogEntry, LogError>> + Send + 'a>;

/// Cumulative log counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogCounters {
    /// Successful appends
    pub appends: u64,
    /// Durability barrier (fsync) calls
    pub sync_calls: u64,
    /// Bytes written to segments, framing included
    pub bytes_written: u64,
    /// Segment rotations
    pub rotations: u64,
}

/// Append-only log of replayable payloads.
pub trait ReplayLog: Send + Sync {
    /// Append a payload and return its position.
    ///
    /// When this returns `Ok`, the entry is as durable as the log's
    /// durability mode promises.
    fn append(&self, payload: &[u8]) -> Result<u64, LogError>;

    /// Read entries with `position >= from`, in order.
    fn read_from(&self, from: u64) -> Result<LogIter<'_>, LogError>;

    /// Position of the last appended entry (0 when empty).
    fn last_position(&self) -> u64;

    /// Force buffered appends to stable storage.
    fn flush(&self) -> Result<(), LogError>;

    /// Cumulative counters.
    fn counters(&self) -> LogCounters {
        LogCounters::default()
    }
}

/// Replay log errors.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// I/O failure
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record failed validation somewhere other than the torn tail
    #[error("log corruption in segment {segment} at offset {offset}: {detail}")]
    Corruption {
        /// Segment number
        segment: u64,
        /// Byte offset of the bad record inside the segment body
        offset: u64,
        /// What failed
        detail: String,
    },

    /// Positions are not contiguous
    #[error("log position gap: expected {expected}, found {found}")]
    PositionGap {
        /// Position the reader expected next
        expected: u64,
        /// Position actually stored
        found: u64,
    },

    /// Payload could not be decoded
    #[error("log codec error: {0}")]
    Codec(#[from] CodecError),

    /// Invalid configuration
    #[error("log configuration error: {0}")]
    Config(#[from] LogConfigError),

    /// Payload exceeds the configured record limit
    #[error("log record of {size} bytes exceeds limit of {max} bytes")]
    RecordTooLarge {
        /// Payload size
        size: u64,
        /// Configured maximum
        max: u64,
    },

    /// The log cannot operate in the requested mode
    #[error("unsupported log mode: {0}")]
    UnsupportedMode(String),
}

impl From<LogError> for CorvidError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Io(io) => CorvidError::from(io),
            LogError::Corruption { .. } | LogError::PositionGap { .. } | LogError::Codec(_) => {
                CorvidError::corruption(e.to_string())
            }
            LogError::Config(_) => CorvidError::invalid_input(e.to_string()),
            LogError::RecordTooLarge { .. } => CorvidError::ResourceExhausted {
                resource: "replay log record".to_string(),
                reason: e.to_string(),
            },
            LogError::UnsupportedMode(_) => CorvidError::not_supported(e.to_string()),
        }
    }
}
