//! # shardckpt
//!
//! Checkpoint lifecycle for training runs whose model and optimizer state is
//! sharded across many cooperating ranks.
//!
//! ## Overview
//!
//! shardckpt provides:
//! - `CheckpointingStrategy` - decides when to save and which checkpoints to retire
//! - `CheckpointExecutor` - gathers sharded state onto the aggregator rank, writes
//!   it durably, deletes retired artifacts, and scatters restored state back out
//! - `Checkpointing` - the session the training loop drives once per step interval
//! - `Collective` - the rank-collective seam (gather / scatter / broadcast)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shardckpt::prelude::*;
//!
//! let ctx = RunContext::from_config(&config, rank)?;
//! let mut checkpointing = Checkpointing::from_config(&config, &ctx)?;
//!
//! // In the training loop, identically on every rank:
//! let outcome = checkpointing.run(marker, &model, &optimizer, &collective)?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod distributed;
pub mod runtime;
pub mod state;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{
        ApplyOutcome, CheckpointExecutor, CheckpointInstruction, CheckpointLayout,
        Checkpointing, CheckpointingStrategy, EntityKind, SaveOutcome,
    };
    pub use crate::config::{AppConfig, RunMode, StrategyConfig};
    pub use crate::context::RunContext;
    pub use crate::distributed::{Collective, SoloCollective, ThreadCollective};
    pub use crate::runtime::{
        ModelShell, OptimizerShell, OptimizerState, ShardPlan, ShardedModel, ShardedOptimizer,
    };
    pub use crate::state::{ParamSpecs, StateDict, Tensor};
    pub use crate::{CheckpointError, RestoreError, Result};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::path::PathBuf;

use crate::checkpoint::format::ArtifactError;
use crate::checkpoint::EntityKind;
use crate::distributed::CollectiveError;

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to persist checkpoint artifact {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint {path} could not be removed. It does not exist!")]
    NotFound { path: PathBuf },

    #[error("Restore failed: {0}")]
    Restore(#[from] RestoreError),

    #[error("Progress marker {current} is not greater than the previous marker {previous}")]
    NonMonotonicProgress { previous: u64, current: u64 },

    #[error("Collective error: {0}")]
    Collective(#[from] CollectiveError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Whether the run must stop. A failed save is survivable: the attempted
    /// checkpoint simply did not happen.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CheckpointError::Persistence { .. })
    }
}

/// Reasons a checkpoint could not be restored. Always fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("Checkpoint artifact {path} does not exist")]
    Missing { path: PathBuf },

    #[error("Checkpoint artifact {path} could not be read: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint artifact {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: ArtifactError,
    },

    #[error("Checkpoint at marker {marker} is partial: {missing} artifact {path} is missing")]
    Incomplete {
        marker: u64,
        missing: EntityKind,
        path: PathBuf,
    },

    #[error("Stored state does not match the target: {0}")]
    StateMismatch(String),

    #[error("Model sharding is not finalized: {0}")]
    ShardingNotFinalized(String),

    #[error("Aggregator rank {rank} failed to load the checkpoint: {reason}")]
    Remote { rank: usize, reason: String },
}

pub type Result<T> = core::result::Result<T, CheckpointError>;
