//! Model/optimizer runtime.
//!
//! Provides:
//! - `ShardPlan` - topology-independent flat partitioning
//! - `ModelShell` / `ShardedModel` - unsharded and per-rank model handles
//! - `OptimizerShell` / `ShardedOptimizer` - optimizer hyperparameters and
//!   per-rank moment shards
//!
//! Sharded handles expose `gather_full_state` and `scatter_full_state`, both
//! rank-collective.

mod model;
mod optimizer;
mod plan;

pub use model::{ModelShell, ShardedModel};
pub use optimizer::{MomentBuffers, OptimizerShell, OptimizerState, ShardedOptimizer};
pub use plan::ShardPlan;
