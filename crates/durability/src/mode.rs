//! Durability mode configuration
//!
//! Controls replay log sync behavior (Cache, Standard, Always).

/// Durability mode for replay log appends
///
/// # Modes
///
/// | Mode | fsync | Data Loss Window |
/// |------|-------|-----------------|
/// | Cache | Never (no files) | Everything on process exit |
/// | Always | Every append | Zero |
/// | Standard | Periodic | Up to interval/batch |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// In-memory log, nothing written to disk
    ///
    /// Use case: tests, ephemeral databases, development.
    Cache,

    /// fsync after every appended batch
    Always,

    /// fsync every N appends OR every T milliseconds, whichever comes first
    Standard {
        /// Maximum time between fsyncs in milliseconds
        interval_ms: u64,
        /// Maximum appends between fsyncs
        batch_size: usize,
    },
}

impl DurabilityMode {
    /// Check if this mode requires log files
    pub fn requires_files(&self) -> bool {
        !matches!(self, DurabilityMode::Cache)
    }

    /// Check if this mode requires an fsync on every append
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Standard mode with 100ms / 1000 appends
    pub fn standard_default() -> Self {
        DurabilityMode::Standard {
            interval_ms: 100,
            batch_size: 1000,
        }
    }

    /// Parse the config-file spelling of a mode
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::standard_default()),
            "always" => Some(DurabilityMode::Always),
            "cache" => Some(DurabilityMode::Cache),
            _ => None,
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        Self::standard_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(DurabilityMode::parse("always"), Some(DurabilityMode::Always));
        assert_eq!(DurabilityMode::parse("cache"), Some(DurabilityMode::Cache));
        assert_eq!(
            DurabilityMode::parse("standard"),
            Some(DurabilityMode::standard_default())
        );
        assert_eq!(DurabilityMode::parse("sometimes"), None);
    }

    #[test]
    fn test_mode_properties() {
        assert!(!DurabilityMode::Cache.requires_files());
        assert!(DurabilityMode::Always.requires_immediate_fsync());
        assert!(DurabilityMode::default().requires_files());
        assert!(!DurabilityMode::default().requires_immediate_fsync());
    }
}
