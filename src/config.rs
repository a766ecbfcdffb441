//! Loader configuration.
//!
//! Every field has a default so a partial JSON document (or none at all)
//! yields a usable configuration.

use crate::error::ErrorKind;
use crate::logging::LoggingConfig;
use crate::streaming::DecodeLevelStep;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retrieve: RetrieveConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on worker threads.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Spawn workers lazily when tasks arrive instead of all at start.
    #[serde(default = "default_true")]
    pub start_workers_on_demand: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            start_workers_on_demand: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveConfig {
    /// Use HTTP byte ranges for web retrieval.
    #[serde(default)]
    pub range_requests: bool,
    /// Read web retrieval responses incrementally.
    #[serde(default)]
    pub streaming: bool,
    /// Size of the first range request.
    #[serde(default = "default_initial_bytes")]
    pub initial_bytes: u64,
    /// Number of range requests covering the whole resource.
    #[serde(default = "default_total_ranges")]
    pub total_ranges: u32,
    /// Bytes that must accumulate before a streamed payload is re-extracted.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    /// Completion fraction to decode level staircase.
    #[serde(default = "default_decode_levels")]
    pub decode_levels: Vec<DecodeLevelStep>,
    /// Treat a lossy delivery as terminal.
    #[serde(default)]
    pub lossy_is_terminal: bool,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            range_requests: false,
            streaming: false,
            initial_bytes: default_initial_bytes(),
            total_ranges: default_total_ranges(),
            min_chunk_size: default_min_chunk_size(),
            decode_levels: default_decode_levels(),
            lossy_is_terminal: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeConfig {
    #[serde(default)]
    pub allow_float_rendering: bool,
    #[serde(default)]
    pub pre_scale: PreScaleConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreScaleConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

fn default_true() -> bool {
    true
}

fn default_initial_bytes() -> u64 {
    64 * 1024
}

fn default_total_ranges() -> u32 {
    2
}

fn default_min_chunk_size() -> usize {
    64 * 1024
}

fn default_decode_levels() -> Vec<DecodeLevelStep> {
    vec![
        DecodeLevelStep {
            below_fraction: 0.08,
            level: 3,
        },
        DecodeLevelStep {
            below_fraction: 0.13,
            level: 2,
        },
        DecodeLevelStep {
            below_fraction: 0.27,
            level: 1,
        },
    ]
}

impl LoaderConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_workers == 0 {
            return Err(ConfigError::Invalid("pool.max_workers must be at least 1".into()));
        }
        if self.retrieve.total_ranges == 0 {
            return Err(ConfigError::Invalid("retrieve.total_ranges must be at least 1".into()));
        }
        if self.retrieve.initial_bytes == 0 {
            return Err(ConfigError::Invalid("retrieve.initial_bytes must be positive".into()));
        }
        let steps = &self.retrieve.decode_levels;
        let increasing = steps
            .windows(2)
            .all(|pair| pair[0].below_fraction < pair[1].below_fraction && pair[0].level > pair[1].level);
        if !increasing {
            return Err(ConfigError::Invalid(
                "retrieve.decode_levels must have increasing fractions and decreasing levels".into(),
            ));
        }
        Ok(())
    }
}
