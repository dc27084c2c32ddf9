//! Configuration management for Gatehouse.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::admission::Rule;
use crate::error::{GatehouseError, Result};

/// Main configuration for the admission manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatehouseConfig {
    /// Maximum pending entries across all buckets of one admission queue.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Interval between adaptive-adjustment cycles, in milliseconds.
    #[serde(default = "default_adaptive_interval_ms")]
    pub adaptive_interval_ms: u64,

    /// System-load threshold above which adaptive rules shrink (0.0 to 1.0).
    #[serde(default = "default_load_threshold")]
    pub load_threshold: f64,

    /// Whether adaptive adjustment runs at all.
    #[serde(default = "default_adaptive_enabled")]
    pub adaptive_enabled: bool,

    /// Rules registered at startup.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Default for GatehouseConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            adaptive_interval_ms: default_adaptive_interval_ms(),
            load_threshold: default_load_threshold(),
            adaptive_enabled: default_adaptive_enabled(),
            rules: Vec::new(),
        }
    }
}

fn default_max_queue_size() -> usize {
    crate::admission::DEFAULT_MAX_QUEUE_SIZE
}

fn default_adaptive_interval_ms() -> u64 {
    30_000
}

fn default_load_threshold() -> f64 {
    0.8
}

fn default_adaptive_enabled() -> bool {
    true
}

impl GatehouseConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatehouseError::Config(format!("Failed to parse config: {}", e)))
    }
}
