//! Strategy and executor driven together from the training loop.

use super::executor::{ApplyOutcome, CheckpointExecutor};
use super::strategy::CheckpointingStrategy;
use crate::config::{AppConfig, RunMode};
use crate::context::RunContext;
use crate::distributed::Collective;
use crate::runtime::{ModelShell, OptimizerShell, ShardedModel, ShardedOptimizer};
use crate::{CheckpointError, Result};

/// Checkpointing for one rank.
///
/// Call [`Checkpointing::run`] at every progress marker, identically on every
/// rank. Only rank identity inside the executor decides who touches disk.
///
/// # Example
///
/// ```ignore
/// let mut checkpointing = Checkpointing::from_config(&config, &ctx)?;
/// for step in 0..steps {
///     train_step(&mut model, &mut optimizer);
///     checkpointing.run(step * batch_size, &model, &optimizer, &collective)?;
/// }
/// ```
#[derive(Debug)]
pub struct Checkpointing {
    strategy: CheckpointingStrategy,
    executor: CheckpointExecutor,
}

impl Checkpointing {
    pub fn new(strategy: CheckpointingStrategy, executor: CheckpointExecutor) -> Self {
        Self { strategy, executor }
    }

    /// Build strategy and executor from configuration. A warm start seeds the
    /// strategy with the resumed marker.
    pub fn from_config(config: &AppConfig, ctx: &RunContext) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CheckpointError::Configuration(e.to_string()))?;

        let mut strategy = CheckpointingStrategy::from_config(&config.checkpointing.strategy)?;
        if let RunMode::WarmStart { resume_marker } = config.run_mode {
            strategy.resume_from(resume_marker);
        }
        let executor = CheckpointExecutor::new(ctx, &config.checkpointing.execution.checkpoint_root);

        Ok(Self::new(strategy, executor))
    }

    /// Decide and act for `marker`. A failed save leaves the strategy as if
    /// the marker had not been saved.
    pub fn run<C: Collective>(
        &mut self,
        marker: u64,
        model: &ShardedModel,
        optimizer: &ShardedOptimizer,
        collective: &C,
    ) -> Result<ApplyOutcome> {
        let instruction = self.strategy.decide(marker)?;
        if instruction.is_noop() {
            return Ok(ApplyOutcome::idle());
        }

        let outcome = self
            .executor
            .apply(&instruction, marker, model, optimizer, collective)?;
        if outcome.save_failed() {
            self.strategy.rollback(&instruction, marker);
        }
        Ok(outcome)
    }

    /// Restore the checkpoint at `marker` into fresh shells.
    pub fn resume<C: Collective>(
        &self,
        marker: u64,
        model_shell: ModelShell,
        optimizer_shell: &OptimizerShell,
        collective: &C,
    ) -> Result<(ShardedModel, ShardedOptimizer)> {
        self.executor
            .restore(marker, model_shell, optimizer_shell, collective)
    }

    pub fn strategy(&self) -> &CheckpointingStrategy {
        &self.strategy
    }

    pub fn executor(&self) -> &CheckpointExecutor {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::distributed::SoloCollective;
    use crate::state::ParamSpecs;
    use tempfile::tempdir;

    fn config(root: &std::path::Path, k: i64) -> AppConfig {
        let mut config = AppConfig::default();
        config.experiment_id = "session".into();
        config.checkpointing.strategy = StrategyConfig::SaveKMostRecent { k, interval: 10 };
        config.checkpointing.execution.checkpoint_root = root.to_path_buf();
        config
    }

    fn handles() -> (ShardedModel, ShardedOptimizer) {
        let mut specs = ParamSpecs::new();
        specs.insert("w".into(), vec![4]);
        let model =
            ShardedModel::scatter_full_state(ModelShell::new(specs), 0, &SoloCollective).unwrap();
        let optimizer = ShardedOptimizer::new(OptimizerShell::default(), &model);
        (model, optimizer)
    }

    #[test]
    fn test_run_keeps_disk_in_step_with_window() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), 2);
        let ctx = RunContext::from_config(&config, 0).unwrap();
        let mut checkpointing = Checkpointing::from_config(&config, &ctx).unwrap();
        let (model, optimizer) = handles();

        for marker in 1..=40 {
            checkpointing
                .run(marker, &model, &optimizer, &SoloCollective)
                .unwrap();
        }

        let on_disk: Vec<u64> = checkpointing
            .executor()
            .layout()
            .scan()
            .unwrap()
            .iter()
            .map(|c| c.marker)
            .collect();
        assert_eq!(on_disk, vec![30, 40]);
        assert_eq!(checkpointing.strategy().retained(), &[30, 40]);
    }

    #[test]
    fn test_warm_start_seeds_strategy() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.run_mode = RunMode::WarmStart { resume_marker: 20 };
        let ctx = RunContext::from_config(&config, 0).unwrap();
        let checkpointing = Checkpointing::from_config(&config, &ctx).unwrap();

        assert_eq!(checkpointing.strategy().retained(), &[20]);
        assert_eq!(checkpointing.strategy().last_marker(), Some(20));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), -3);
        let ctx = RunContext::new(0, 1, 0, 0, "session").unwrap();
        assert!(matches!(
            Checkpointing::from_config(&config, &ctx),
            Err(CheckpointError::Configuration(_))
        ));
    }
}
