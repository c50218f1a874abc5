//! Run configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::context::is_valid_experiment_id;
pub use crate::checkpoint::StrategyConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Whether the run starts fresh or resumes from a checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    FromScratch,
    WarmStart {
        /// Progress marker of the checkpoint to resume.
        resume_marker: u64,
    },
}

/// Where and by whom checkpoints are written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Root directory; each experiment gets its own subdirectory
    pub checkpoint_root: PathBuf,
    /// Rank that gathers, writes and reads full state
    pub aggregator_rank: usize,
    /// Rank that deletes retired artifacts
    pub primary_rank: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            checkpoint_root: PathBuf::from("checkpoints"),
            aggregator_rank: 0,
            primary_rank: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingConfig {
    pub strategy: StrategyConfig,
    pub execution: ExecutionConfig,
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Stable identifier for the whole run
    pub experiment_id: String,
    /// Number of ranks
    pub world_size: usize,
    pub run_mode: RunMode,
    pub checkpointing: CheckpointingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            experiment_id: "default".to_string(),
            world_size: 1,
            run_mode: RunMode::FromScratch,
            checkpointing: CheckpointingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_experiment_id(&self.experiment_id) {
            return Err(ConfigError::Invalid(format!(
                "experiment_id '{}' must be a non-empty name without path separators, '.' or '..'",
                self.experiment_id
            )));
        }
        if self.world_size == 0 {
            return Err(ConfigError::Invalid("world_size must be > 0".into()));
        }

        let execution = &self.checkpointing.execution;
        if execution.aggregator_rank >= self.world_size {
            return Err(ConfigError::Invalid(format!(
                "aggregator_rank {} must be < world_size {}",
                execution.aggregator_rank, self.world_size
            )));
        }
        if execution.primary_rank >= self.world_size {
            return Err(ConfigError::Invalid(format!(
                "primary_rank {} must be < world_size {}",
                execution.primary_rank, self.world_size
            )));
        }

        match self.checkpointing.strategy {
            StrategyConfig::SaveEveryKSteps { k } if k <= 0 => Err(ConfigError::Invalid(format!(
                "save_every_k_steps.k must be > 0, got {}",
                k
            ))),
            StrategyConfig::SaveKMostRecent { k, .. } if k < -1 => Err(ConfigError::Invalid(
                format!("save_k_most_recent.k must be >= -1, got {}", k),
            )),
            StrategyConfig::SaveKMostRecent { interval: 0, .. } => Err(ConfigError::Invalid(
                "save_k_most_recent.interval must be > 0".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
