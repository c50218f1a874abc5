//! Checkpoint I/O across ranks.
//!
//! Every public method here is rank-collective: all ranks call it with the
//! same arguments in the same order, and only the aggregator (for save and
//! load) or the primary (for delete) touches the filesystem. After each step
//! that only one rank performs, that rank broadcasts a `Verdict` so that every
//! rank returns the same result and nobody is left waiting in a later
//! collective.

use super::format::{read_artifact, write_artifact};
use super::instruction::{CheckpointInstruction, EntityKind};
use super::layout::CheckpointLayout;
use crate::context::RunContext;
use crate::distributed::{Collective, CollectiveError};
use crate::runtime::{
    ModelShell, OptimizerShell, OptimizerState, ShardedModel, ShardedOptimizer,
};
use crate::state::StateDict;
use crate::utils::format_duration;
use crate::{CheckpointError, RestoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Outcome of a step performed by a single rank, as seen by everyone else.
#[derive(Debug, Serialize, Deserialize)]
enum Verdict {
    Done,
    Persistence { path: PathBuf, reason: String },
    NotFound { path: PathBuf },
    Restore { reason: String },
    Failed { reason: String },
}

impl Verdict {
    fn of(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Verdict::Done,
            Err(CheckpointError::Persistence { path, source }) => Verdict::Persistence {
                path: path.clone(),
                reason: source.to_string(),
            },
            Err(CheckpointError::NotFound { path }) => Verdict::NotFound { path: path.clone() },
            Err(CheckpointError::Restore(e)) => Verdict::Restore {
                reason: e.to_string(),
            },
            Err(e) => Verdict::Failed {
                reason: e.to_string(),
            },
        }
    }

    fn into_result(self, root: usize) -> Result<()> {
        match self {
            Verdict::Done => Ok(()),
            Verdict::Persistence { path, reason } => Err(CheckpointError::Persistence {
                path,
                source: io::Error::other(reason),
            }),
            Verdict::NotFound { path } => Err(CheckpointError::NotFound { path }),
            Verdict::Restore { reason } => {
                Err(RestoreError::Remote { rank: root, reason }.into())
            }
            Verdict::Failed { reason } => Err(CollectiveError::Protocol(format!(
                "rank {} reported: {}",
                root, reason
            ))
            .into()),
        }
    }
}

/// What happened to the save requested by an instruction.
#[derive(Debug)]
pub enum SaveOutcome {
    NotRequested,
    Saved,
    /// The save failed but the run may continue.
    Failed(CheckpointError),
}

/// Result of applying one instruction. Identical on every rank.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub save: SaveOutcome,
    /// Markers whose artifacts were removed.
    pub deleted: Vec<u64>,
}

impl ApplyOutcome {
    pub fn idle() -> Self {
        Self {
            save: SaveOutcome::NotRequested,
            deleted: Vec::new(),
        }
    }

    pub fn saved(&self) -> bool {
        matches!(self.save, SaveOutcome::Saved)
    }

    pub fn save_failed(&self) -> bool {
        matches!(self.save, SaveOutcome::Failed(_))
    }
}

/// Performs checkpoint I/O for one rank.
#[derive(Clone, Debug)]
pub struct CheckpointExecutor {
    ctx: RunContext,
    layout: CheckpointLayout,
}

impl CheckpointExecutor {
    pub fn new(ctx: &RunContext, checkpoint_root: impl Into<PathBuf>) -> Self {
        Self {
            layout: CheckpointLayout::new(checkpoint_root, ctx.experiment_id()),
            ctx: ctx.clone(),
        }
    }

    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    fn ensure_topology<C: Collective>(&self, collective: &C) -> Result<()> {
        if collective.rank() != self.ctx.rank() || collective.world_size() != self.ctx.world_size()
        {
            return Err(CheckpointError::Configuration(format!(
                "collective is rank {}/{} but the run context is rank {}/{}",
                collective.rank(),
                collective.world_size(),
                self.ctx.rank(),
                self.ctx.world_size()
            )));
        }
        Ok(())
    }

    /// Share the result of a step only `root` performed. `root` passes its
    /// own result; everyone returns the equivalent of it.
    fn agree<C: Collective>(&self, root: usize, local: Result<()>, collective: &C) -> Result<()> {
        if collective.is_root(root) {
            collective.broadcast(root, Some(Verdict::of(&local)))?;
            local
        } else {
            let verdict: Verdict = collective.broadcast(root, None)?;
            verdict.into_result(root)
        }
    }

    /// Gather full model and optimizer state onto the aggregator and write
    /// both artifacts for `marker`.
    pub fn save<C: Collective>(
        &self,
        model: &ShardedModel,
        optimizer: &ShardedOptimizer,
        marker: u64,
        collective: &C,
    ) -> Result<()> {
        self.ensure_topology(collective)?;
        let started = Instant::now();
        let root = self.ctx.aggregator_rank();

        // Both gathers run on every rank before anyone can bail out.
        let model_full = model.gather_full_state(root, collective);
        let optimizer_full = optimizer.gather_full_state(model, root, collective);

        let local = if self.ctx.is_aggregator() {
            match (model_full, optimizer_full) {
                (Ok(Some(m)), Ok(Some(o))) => self.persist(marker, &m, &o),
                (Err(e), _) | (_, Err(e)) => Err(e.into()),
                _ => Err(CollectiveError::Protocol("aggregator received no state".into()).into()),
            }
        } else {
            model_full?;
            optimizer_full?;
            Ok(())
        };

        self.agree(root, local, collective)?;
        tracing::info!(
            rank = self.ctx.rank(),
            marker,
            elapsed = %format_duration(started.elapsed()),
            "Checkpoint saved"
        );
        Ok(())
    }

    fn persist(&self, marker: u64, model: &StateDict, optimizer: &OptimizerState) -> Result<()> {
        let dir = self.layout.experiment_dir();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Persistence {
            path: dir.clone(),
            source,
        })?;

        let model_path = self.layout.artifact_path(EntityKind::Model, marker);
        let model_bytes = write_artifact(&model_path, EntityKind::Model, marker, model)
            .map_err(|source| CheckpointError::Persistence {
                path: model_path.clone(),
                source,
            })?;

        let optimizer_path = self.layout.artifact_path(EntityKind::Optimizer, marker);
        let optimizer_bytes =
            match write_artifact(&optimizer_path, EntityKind::Optimizer, marker, optimizer) {
                Ok(bytes) => bytes,
                Err(source) => {
                    // A failed save leaves no partial checkpoint.
                    if let Err(e) = fs::remove_file(&model_path) {
                        tracing::warn!(
                            marker,
                            path = %model_path.display(),
                            error = %e,
                            "Could not remove orphaned model artifact"
                        );
                    }
                    return Err(CheckpointError::Persistence {
                        path: optimizer_path,
                        source,
                    });
                }
            };

        tracing::debug!(
            marker,
            model = %model_path.display(),
            model_bytes,
            optimizer_bytes,
            "Artifacts written"
        );
        Ok(())
    }

    /// Remove both artifacts of `marker`. Only the primary rank acts; other
    /// ranks return immediately. Fails without removing anything if either
    /// artifact is absent.
    pub fn delete(&self, marker: u64) -> Result<()> {
        if !self.ctx.is_primary() {
            return Ok(());
        }

        let paths: Vec<PathBuf> = EntityKind::ALL
            .iter()
            .map(|&kind| self.layout.artifact_path(kind, marker))
            .collect();
        if let Some(missing) = paths.iter().find(|p| !p.is_file()) {
            tracing::error!(marker, path = %missing.display(), "Checkpoint to delete is missing");
            return Err(CheckpointError::NotFound {
                path: missing.clone(),
            });
        }

        for path in &paths {
            fs::remove_file(path)?;
        }
        tracing::info!(marker, "Checkpoint deleted");
        Ok(())
    }

    /// Carry out one instruction: save first, then delete. A failed save is
    /// reported in the outcome and its deletions are skipped.
    pub fn apply<C: Collective>(
        &self,
        instruction: &CheckpointInstruction,
        marker: u64,
        model: &ShardedModel,
        optimizer: &ShardedOptimizer,
        collective: &C,
    ) -> Result<ApplyOutcome> {
        self.ensure_topology(collective)?;

        let save = if instruction.save_current {
            match self.save(model, optimizer, marker, collective) {
                Ok(()) => SaveOutcome::Saved,
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(
                        rank = self.ctx.rank(),
                        marker,
                        error = %e,
                        "Checkpoint save failed; continuing without it"
                    );
                    return Ok(ApplyOutcome {
                        save: SaveOutcome::Failed(e),
                        deleted: Vec::new(),
                    });
                }
                Err(e) => return Err(e),
            }
        } else {
            SaveOutcome::NotRequested
        };

        let mut deleted = Vec::with_capacity(instruction.checkpoints_to_delete.len());
        for &old in &instruction.checkpoints_to_delete {
            let local = self.delete(old);
            self.agree(self.ctx.primary_rank(), local, collective)?;
            deleted.push(old);
        }

        Ok(ApplyOutcome { save, deleted })
    }

    /// Load a full model state on the aggregator and shard it across ranks.
    pub fn load_model<C: Collective>(
        &self,
        mut shell: ModelShell,
        path: &Path,
        collective: &C,
    ) -> Result<ShardedModel> {
        self.ensure_topology(collective)?;
        let started = Instant::now();
        let root = self.ctx.aggregator_rank();

        let local = if self.ctx.is_aggregator() {
            read_artifact::<StateDict>(path, EntityKind::Model)
                .and_then(|(_, state)| shell.load_state_dict(state))
                .map_err(CheckpointError::from)
        } else {
            Ok(())
        };
        self.agree(root, local, collective)?;

        let model = ShardedModel::scatter_full_state(shell, root, collective)?;
        tracing::info!(
            rank = self.ctx.rank(),
            path = %path.display(),
            elapsed = %format_duration(started.elapsed()),
            "Model restored"
        );
        Ok(model)
    }

    /// Load a full optimizer state on the aggregator and shard it the way
    /// `model` is sharded. `model` must already be sharded for this topology.
    pub fn load_optimizer<C: Collective>(
        &self,
        shell: &OptimizerShell,
        model: &ShardedModel,
        path: &Path,
        collective: &C,
    ) -> Result<ShardedOptimizer> {
        self.ensure_topology(collective)?;
        if !model.is_sharded_for(self.ctx.rank(), self.ctx.world_size()) {
            return Err(RestoreError::ShardingNotFinalized(format!(
                "model is sharded for rank {} of {}, expected rank {} of {}",
                model.rank(),
                model.plan().world_size(),
                self.ctx.rank(),
                self.ctx.world_size()
            ))
            .into());
        }
        let started = Instant::now();
        let root = self.ctx.aggregator_rank();

        let mut full = None;
        let local = if self.ctx.is_aggregator() {
            self.read_optimizer(shell, model, path).map(|state| {
                full = Some(state);
            })
        } else {
            Ok(())
        };
        self.agree(root, local, collective)?;

        let optimizer = ShardedOptimizer::scatter_full_state(full, model, root, collective)?;
        tracing::info!(
            rank = self.ctx.rank(),
            path = %path.display(),
            step = optimizer.step(),
            elapsed = %format_duration(started.elapsed()),
            "Optimizer restored"
        );
        Ok(optimizer)
    }

    fn read_optimizer(
        &self,
        shell: &OptimizerShell,
        model: &ShardedModel,
        path: &Path,
    ) -> Result<OptimizerState> {
        let (_, state) = read_artifact::<OptimizerState>(path, EntityKind::Optimizer)?;
        state
            .check_against(model.plan().specs())
            .map_err(RestoreError::StateMismatch)?;
        if state.hyper != *shell {
            tracing::warn!(
                stored = ?state.hyper,
                configured = ?shell,
                "Stored optimizer hyperparameters differ from the configured ones; using stored"
            );
        }
        Ok(state)
    }

    /// Restore the complete checkpoint at `marker`: model first, then
    /// optimizer. Fails if either artifact is absent.
    pub fn restore<C: Collective>(
        &self,
        marker: u64,
        model_shell: ModelShell,
        optimizer_shell: &OptimizerShell,
        collective: &C,
    ) -> Result<(ShardedModel, ShardedOptimizer)> {
        self.ensure_topology(collective)?;
        let root = self.ctx.aggregator_rank();

        let local = if self.ctx.is_aggregator() {
            self.check_complete(marker)
        } else {
            Ok(())
        };
        if let Err(e) = &local {
            tracing::error!(marker, error = %e, "Refusing to restore partial checkpoint");
        }
        self.agree(root, local, collective)?;

        let model_path = self.layout.artifact_path(EntityKind::Model, marker);
        let optimizer_path = self.layout.artifact_path(EntityKind::Optimizer, marker);
        let model = self.load_model(model_shell, &model_path, collective)?;
        let optimizer = self.load_optimizer(optimizer_shell, &model, &optimizer_path, collective)?;
        Ok((model, optimizer))
    }

    fn check_complete(&self, marker: u64) -> Result<()> {
        for kind in EntityKind::ALL {
            let path = self.layout.artifact_path(kind, marker);
            if !path.is_file() {
                return Err(RestoreError::Incomplete {
                    marker,
                    missing: kind,
                    path,
                }
                .into());
            }
        }
        Ok(())
    }
}
