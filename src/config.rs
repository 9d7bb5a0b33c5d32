//! Configuration for the maintenance pipelines.
//!
//! Every knob has a default; hosts typically deserialize a partial JSON
//! document and call [`MaintenanceConfig::validate`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, KyroGraphError, StorageError};
use crate::node::NodeType;
use crate::storage::read_json_or_none;

/// Bootstrap pipeline knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Character budget per batch; 0 sends one chunk per batch.
    pub char_budget: usize,
    /// Maximum characters per source chunk produced by `chunk_text`.
    pub chunk_max_chars: usize,
    /// Concurrent batch workers.
    pub concurrency: usize,
    /// Batches processed before the run pauses; `None` runs to completion.
    pub max_batches_per_run: Option<usize>,
    pub call_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Coalescing window for state writes.
    pub persist_debounce_ms: u64,
    /// Run the maintenance hook once after the first completed bootstrap.
    pub run_maintenance: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            char_budget: 12_000,
            chunk_max_chars: 4_000,
            concurrency: 3,
            max_batches_per_run: None,
            call_timeout_ms: 120_000,
            heartbeat_interval_ms: 60_000,
            persist_debounce_ms: 500,
            run_maintenance: true,
        }
    }
}

impl BootstrapConfig {
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Rejects values the runner cannot operate with.
    ///
    /// # Errors
    /// Returns a `ConfigError` naming the first offending field.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::new("bootstrap.concurrency", "must be at least 1"));
        }
        if self.chunk_max_chars == 0 {
            return Err(ConfigError::new("bootstrap.chunk_max_chars", "must be at least 1"));
        }
        if self.max_batches_per_run == Some(0) {
            return Err(ConfigError::new(
                "bootstrap.max_batches_per_run",
                "must be at least 1 when set",
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::new("bootstrap.call_timeout_ms", "must be positive"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::new("bootstrap.heartbeat_interval_ms", "must be positive"));
        }
        Ok(self)
    }
}

/// Dedup pipeline knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Minimum combined similarity for a candidate pair.
    pub similarity_threshold: f64,
    pub max_pairs_per_bucket: usize,
    pub max_cluster_size: usize,
    pub max_clusters: usize,
    /// Types whose records describe events and must not merge across time.
    pub volatile_types: Vec<NodeType>,
    pub volatile_window_hours: i64,
    /// Minimum similarity for an edge in the semantic block pass.
    pub block_threshold: f64,
    pub block_window_days: i64,
    pub max_block_size: usize,
    pub max_blocks: usize,
    pub call_timeout_ms: u64,
    pub max_output_tokens: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.55,
            max_pairs_per_bucket: 50,
            max_cluster_size: 5,
            max_clusters: 20,
            volatile_types: vec![NodeType::Episode],
            volatile_window_hours: 72,
            block_threshold: 0.35,
            block_window_days: 30,
            max_block_size: 6,
            max_blocks: 10,
            call_timeout_ms: 120_000,
            max_output_tokens: 4_096,
        }
    }
}

impl DedupConfig {
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    #[must_use]
    pub fn volatile_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.volatile_window_hours)
    }

    #[must_use]
    pub fn block_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.block_window_days)
    }

    /// Rejects values the candidate generator cannot operate with.
    ///
    /// # Errors
    /// Returns a `ConfigError` naming the first offending field.
    pub fn validate(self) -> Result<Self, ConfigError> {
        for (field, value) in [
            ("dedup.similarity_threshold", self.similarity_threshold),
            ("dedup.block_threshold", self.block_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::new(field, format!("{value} is outside [0, 1]")));
            }
        }
        if self.max_cluster_size < 2 {
            return Err(ConfigError::new("dedup.max_cluster_size", "must be at least 2"));
        }
        if self.max_block_size < 2 {
            return Err(ConfigError::new("dedup.max_block_size", "must be at least 2"));
        }
        if self.volatile_window_hours < 0 || self.block_window_days < 0 {
            return Err(ConfigError::new("dedup.windows", "must not be negative"));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::new("dedup.call_timeout_ms", "must be positive"));
        }
        Ok(self)
    }
}

/// Combined configuration for both pipelines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub bootstrap: BootstrapConfig,
    pub dedup: DedupConfig,
}

impl MaintenanceConfig {
    /// Validates both sections.
    ///
    /// # Errors
    /// Returns the first `ConfigError` found.
    pub fn validate(self) -> Result<Self, ConfigError> {
        Ok(Self {
            bootstrap: self.bootstrap.validate()?,
            dedup: self.dedup.validate()?,
        })
    }

    /// Loads and validates a JSON config file; a missing file yields defaults.
    ///
    /// # Errors
    /// Returns a storage error for unreadable or malformed files and a config
    /// error for invalid values.
    pub fn from_json_file(path: &Path) -> Result<Self, KyroGraphError> {
        let config: Option<Self> = read_json_or_none(path)?;
        Ok(config.unwrap_or_default().validate()?)
    }

    /// Parses and validates a JSON config document.
    ///
    /// # Errors
    /// Returns a storage error for malformed JSON and a config error for
    /// invalid values.
    pub fn from_json_str(text: &str) -> Result<Self, KyroGraphError> {
        let config: Self = serde_json::from_str(text).map_err(|e| StorageError::Parse {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?;
        Ok(config.validate()?)
    }
}
