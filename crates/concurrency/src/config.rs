//! Merger configuration
//!
//! Controls the batch window of a partition merger and the depth of its
//! submission queue.

use std::time::Duration;

/// Configuration for one partition merger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergerConfig {
    /// Maximum commands executed in one storage transaction
    pub max_batch_size: usize,
    /// Maximum age of an open batch window
    pub max_batch_duration: Duration,
    /// Maximum queued (not yet executing) commands before submission fails
    pub queue_capacity: usize,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1024,
            max_batch_duration: Duration::from_millis(10),
            queue_capacity: 16 * 1024,
        }
    }
}

impl MergerConfig {
    /// Create a MergerConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum batch size
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set maximum batch window duration
    pub fn with_max_batch_duration(mut self, max_batch_duration: Duration) -> Self {
        self.max_batch_duration = max_batch_duration;
        self
    }

    /// Set queue capacity
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// One command per batch; useful when a test needs deterministic batch boundaries
    pub fn unbatched() -> Self {
        Self::default().with_max_batch_size(1)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), MergerConfigError> {
        if self.max_batch_size == 0 {
            return Err(MergerConfigError::ZeroBatchSize);
        }
        if self.max_batch_duration.is_zero() {
            return Err(MergerConfigError::ZeroBatchDuration);
        }
        if self.queue_capacity == 0 {
            return Err(MergerConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

/// Merger configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergerConfigError {
    /// `max_batch_size` is zero
    #[error("max batch size must be at least 1")]
    ZeroBatchSize,

    /// `max_batch_duration` is zero
    #[error("max batch duration must be positive")]
    ZeroBatchDuration,

    /// `queue_capacity` is zero
    #[error("queue capacity must be at least 1")]
    ZeroQueueCapacity,
}

impl From<MergerConfigError> for corvid_core::CorvidError {
    fn from(e: MergerConfigError) -> Self {
        corvid_core::CorvidError::invalid_input(e.to_string())
    }
}
