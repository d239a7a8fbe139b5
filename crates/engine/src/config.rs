//! Node configuration via `corvid.toml`
//!
//! On first open a commented default `corvid.toml` is written to the data
//! directory. To change settings, edit the file and restart.

use corvid_concurrency::MergerConfig;
use corvid_core::{CorvidError, CorvidResult};
use corvid_durability::{DurabilityMode, LogConfig};
use corvid_storage::DEFAULT_DECISION_RETENTION;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the node data directory.
pub const CONFIG_FILE_NAME: &str = "corvid.toml";

/// `[merger]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergerSection {
    /// Commands per batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Batch window in milliseconds
    #[serde(default = "default_max_batch_duration_ms")]
    pub max_batch_duration_ms: u64,
    /// Queued commands per partition before submissions are rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_batch_size() -> usize {
    MergerConfig::default().max_batch_size
}

fn default_max_batch_duration_ms() -> u64 {
    MergerConfig::default().max_batch_duration.as_millis() as u64
}

fn default_queue_capacity() -> usize {
    MergerConfig::default().queue_capacity
}

impl Default for MergerSection {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_duration_ms: default_max_batch_duration_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// `[log]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    /// Segment rotation threshold in bytes
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
}

fn default_segment_size() -> u64 {
    LogConfig::default().segment_size
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
        }
    }
}

/// `[cluster]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Consensus indexes whose cluster transaction decisions are kept
    #[serde(default = "default_decision_retention")]
    pub decision_retention: u64,
}

fn default_decision_retention() -> u64 {
    DEFAULT_DECISION_RETENTION
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            decision_retention: default_decision_retention(),
        }
    }
}

/// Node configuration loaded from `corvid.toml`.
///
/// # Example
///
/// ```toml
/// durability = "standard"
///
/// [merger]
/// max_batch_size = 1024
/// max_batch_duration_ms = 10
/// queue_capacity = 16384
///
/// [log]
/// segment_size = 67108864
///
/// [cluster]
/// decision_retention = 10000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorvidConfig {
    /// Durability mode: `"standard"`, `"always"` or `"cache"`.
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Transaction merger settings
    #[serde(default)]
    pub merger: MergerSection,
    /// Replay log settings
    #[serde(default)]
    pub log: LogSection,
    /// Cluster state machine settings
    #[serde(default)]
    pub cluster: ClusterSection,
}

fn default_durability_str() -> String {
    "standard".to_string()
}

impl Default for CorvidConfig {
    fn default() -> Self {
        Self {
            durability: default_durability_str(),
            merger: MergerSection::default(),
            log: LogSection::default(),
            cluster: ClusterSection::default(),
        }
    }
}

impl CorvidConfig {
    /// Configuration of an ephemeral node: no files, in-memory logs.
    pub fn cache() -> Self {
        Self {
            durability: "cache".to_string(),
            ..Self::default()
        }
    }

    /// Parse the durability string into a `DurabilityMode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"standard"`, `"always"` or `"cache"`.
    pub fn durability_mode(&self) -> CorvidResult<DurabilityMode> {
        DurabilityMode::parse(&self.durability).ok_or_else(|| {
            CorvidError::invalid_input(format!(
                "Invalid durability mode '{}' in corvid.toml. Expected \"standard\", \"always\" or \"cache\".",
                self.durability
            ))
        })
    }

    /// Merger settings as a validated [`MergerConfig`].
    pub fn merger_config(&self) -> CorvidResult<MergerConfig> {
        let config = MergerConfig::new()
            .with_max_batch_size(self.merger.max_batch_size)
            .with_max_batch_duration(Duration::from_millis(self.merger.max_batch_duration_ms))
            .with_queue_capacity(self.merger.queue_capacity);
        config.validate()?;
        Ok(config)
    }

    /// Log settings as a validated [`LogConfig`].
    pub fn log_config(&self) -> CorvidResult<LogConfig> {
        let config = LogConfig::default().with_segment_size(self.log.segment_size);
        config
            .validate()
            .map_err(|e| CorvidError::invalid_input(format!("[log] {}", e)))?;
        Ok(config)
    }

    /// Check every section eagerly.
    pub fn validate(&self) -> CorvidResult<()> {
        self.durability_mode()?;
        self.merger_config()?;
        self.log_config()?;
        if self.cluster.decision_retention == 0 {
            return Err(CorvidError::invalid_input(
                "[cluster] decision_retention must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Corvid node configuration
#
# Durability mode: "standard" (default), "always" or "cache"
#   "standard" = fsync every 100ms or 1000 appends, may lose the last interval on crash
#   "always"   = fsync every batch, zero data loss
#   "cache"    = no log files, everything is lost on restart
durability = "standard"

[merger]
# Upper bound on commands merged into one storage transaction
max_batch_size = 1024
# How long a batch window stays open once the first command is taken
max_batch_duration_ms = 10
# Queued commands per partition before submissions are rejected
queue_capacity = 16384

[log]
# Replay log segment rotation threshold in bytes (64 MiB)
segment_size = 67108864

[cluster]
# Consensus indexes whose cluster transaction decisions are kept
decision_retention = 10000
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> CorvidResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CorvidError::storage(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: CorvidConfig = toml::from_str(&content).map_err(|e| {
            CorvidError::invalid_input(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> CorvidResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                CorvidError::storage(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> CorvidResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CorvidError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            CorvidError::storage(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
