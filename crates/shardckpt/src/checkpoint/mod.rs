//! Checkpoint lifecycle for sharded training state.
//!
//! Provides:
//! - `CheckpointingStrategy` for deciding when to save and what to retire
//! - `CheckpointInstruction` as the contract between strategy and executor
//! - `CheckpointExecutor` for rank-collective save, delete, load and restore
//! - `Checkpointing` for driving both from the training loop

pub mod format;
pub mod layout;

mod executor;
mod instruction;
mod session;
mod strategy;

pub use executor::{ApplyOutcome, CheckpointExecutor, SaveOutcome};
pub use instruction::{CheckpointInstruction, EntityKind};
pub use layout::{CheckpointLayout, CheckpointListing};
pub use session::Checkpointing;
pub use strategy::{
    CheckpointingStrategy, Retention, SaveEveryKSteps, SaveKMostRecent, StrategyConfig,
};
