//! Replay log configuration.

/// Replay log configuration parameters.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum segment size in bytes (default: 64MB).
    ///
    /// When appending a record would exceed this size, a new segment is created.
    pub segment_size: u64,

    /// Largest payload accepted by `append` (default: 32MB).
    pub max_record_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            segment_size: 64 * 1024 * 1024,
            max_record_size: 32 * 1024 * 1024,
        }
    }
}

impl LogConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set segment size (builder pattern).
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Set maximum record size (builder pattern).
    pub fn with_max_record_size(mut self, size: u64) -> Self {
        self.max_record_size = size;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), LogConfigError> {
        if self.segment_size < 1024 {
            return Err(LogConfigError::SegmentSizeTooSmall);
        }
        if self.max_record_size == 0 || self.max_record_size > u32::MAX as u64 - 64 {
            return Err(LogConfigError::InvalidRecordSize);
        }
        Ok(())
    }

    /// Small segments for faster rotation in tests.
    pub fn for_testing() -> Self {
        LogConfig {
            segment_size: 4 * 1024,
            max_record_size: 1024 * 1024,
        }
    }
}

/// Replay log configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogConfigError {
    /// Segment size is too small (minimum 1KB).
    #[error("segment size must be at least 1KB")]
    SegmentSizeTooSmall,

    /// Record size limit is zero or does not fit the length prefix.
    #[error("max record size must be between 1 byte and 4GB")]
    InvalidRecordSize,
}
