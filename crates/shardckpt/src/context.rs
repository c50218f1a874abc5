//! Per-process run identity.

use crate::config::AppConfig;
use crate::{CheckpointError, Result};

/// Whether `id` names a single directory under the checkpoint root.
pub fn is_valid_experiment_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

/// Who this process is within the run. Built once at startup and handed to
/// the strategy and executor; nothing below reads ambient process state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunContext {
    rank: usize,
    world_size: usize,
    aggregator_rank: usize,
    primary_rank: usize,
    experiment_id: String,
}

impl RunContext {
    pub fn new(
        rank: usize,
        world_size: usize,
        aggregator_rank: usize,
        primary_rank: usize,
        experiment_id: impl Into<String>,
    ) -> Result<Self> {
        let experiment_id = experiment_id.into();

        if world_size == 0 {
            return Err(CheckpointError::Configuration(
                "world size must be > 0".into(),
            ));
        }
        for (what, value) in [
            ("rank", rank),
            ("aggregator rank", aggregator_rank),
            ("primary rank", primary_rank),
        ] {
            if value >= world_size {
                return Err(CheckpointError::Configuration(format!(
                    "{} {} out of range for world size {}",
                    what, value, world_size
                )));
            }
        }
        if !is_valid_experiment_id(&experiment_id) {
            return Err(CheckpointError::Configuration(format!(
                "invalid experiment id '{}'",
                experiment_id
            )));
        }

        Ok(Self {
            rank,
            world_size,
            aggregator_rank,
            primary_rank,
            experiment_id,
        })
    }

    /// Context for `rank` under the given configuration.
    pub fn from_config(config: &AppConfig, rank: usize) -> Result<Self> {
        let execution = &config.checkpointing.execution;
        Self::new(
            rank,
            config.world_size,
            execution.aggregator_rank,
            execution.primary_rank,
            config.experiment_id.clone(),
        )
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn aggregator_rank(&self) -> usize {
        self.aggregator_rank
    }

    pub fn primary_rank(&self) -> usize {
        self.primary_rank
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    pub fn is_aggregator(&self) -> bool {
        self.rank == self.aggregator_rank
    }

    pub fn is_primary(&self) -> bool {
        self.rank == self.primary_rank
    }

    /// The same context seen from another rank.
    pub fn for_rank(&self, rank: usize) -> Result<Self> {
        Self::new(
            rank,
            self.world_size,
            self.aggregator_rank,
            self.primary_rank,
            self.experiment_id.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        let ctx = RunContext::new(1, 4, 1, 0, "exp").unwrap();
        assert!(ctx.is_aggregator());
        assert!(!ctx.is_primary());
        assert!(ctx.for_rank(0).unwrap().is_primary());
    }

    #[test]
    fn test_rejects_invalid_ranks() {
        assert!(RunContext::new(0, 0, 0, 0, "exp").is_err());
        assert!(RunContext::new(4, 4, 0, 0, "exp").is_err());
        assert!(RunContext::new(0, 4, 4, 0, "exp").is_err());
        assert!(RunContext::new(0, 4, 0, 7, "exp").is_err());
        assert!(matches!(
            RunContext::new(0, 1, 0, 0, "a/b"),
            Err(CheckpointError::Configuration(_))
        ));
        assert!(RunContext::new(0, 1, 0, 0, "").is_err());
    }

    #[test]
    fn test_rejects_experiment_ids_that_leave_the_root() {
        for id in [".", "..", "a\\b", "../up"] {
            assert!(
                matches!(
                    RunContext::new(0, 1, 0, 0, id),
                    Err(CheckpointError::Configuration(_))
                ),
                "{id} accepted"
            );
        }
        assert!(RunContext::new(0, 1, 0, 0, "run..2").is_ok());
    }
}
