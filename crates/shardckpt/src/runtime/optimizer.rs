//! Optimizer handles.
//!
//! Optimizer state is keyed by parameter name and holds Adam-style first and
//! second moment buffers with the same shape as the parameter, so it is
//! partitioned with the model's own `ShardPlan`.

use super::model::ShardedModel;
use super::plan::ShardPlan;
use crate::distributed::{Collective, CollectiveError};
use crate::state::{check_state, ParamSpecs, StateDict, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Optimizer hyperparameters; the shell an optimizer is restored into.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerShell {
    /// Learning rate
    pub lr: f64,
    /// Moment decay rates
    pub betas: (f64, f64),
    /// Numerical stability term
    pub eps: f64,
    /// Decoupled weight decay
    pub weight_decay: f64,
}

impl Default for OptimizerShell {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            betas: (0.9, 0.95),
            eps: 1e-8,
            weight_decay: 0.1,
        }
    }
}

/// Moment buffers for one parameter (full or shard).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MomentBuffers {
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
}

/// Full (unsharded) optimizer state, as stored on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: u64,
    pub hyper: OptimizerShell,
    pub moments: BTreeMap<String, MomentBuffers>,
}

impl OptimizerState {
    /// Check the state covers exactly the parameters in `specs`.
    pub fn check_against(&self, specs: &ParamSpecs) -> Result<(), String> {
        let (exp_avg, exp_avg_sq) = unzip(&self.moments);
        check_state(&exp_avg, specs).map_err(|e| format!("exp_avg: {}", e))?;
        check_state(&exp_avg_sq, specs).map_err(|e| format!("exp_avg_sq: {}", e))
    }
}

/// Per-rank payload exchanged during gather/scatter.
#[derive(Serialize, Deserialize)]
struct OptimizerShard {
    step: u64,
    hyper: OptimizerShell,
    moments: BTreeMap<String, MomentBuffers>,
}

/// This rank's shard of the optimizer state.
#[derive(Clone, Debug)]
pub struct ShardedOptimizer {
    hyper: OptimizerShell,
    step: u64,
    moments: BTreeMap<String, MomentBuffers>,
}

impl ShardedOptimizer {
    /// Fresh optimizer with zeroed moments shaped like the model's local shards.
    pub fn new(shell: OptimizerShell, model: &ShardedModel) -> Self {
        let zeros = model.plan().zeros(model.rank());
        let moments = zip(zeros.clone(), zeros);
        Self {
            hyper: shell,
            step: 0,
            moments,
        }
    }

    /// Collect the full optimizer state onto `root`. Rank-collective: returns
    /// `Some` on `root` only.
    pub fn gather_full_state<C: Collective>(
        &self,
        model: &ShardedModel,
        root: usize,
        collective: &C,
    ) -> Result<Option<OptimizerState>, CollectiveError> {
        let gathered = match collective.gather(root, &self.moments)? {
            Some(g) => g,
            None => return Ok(None),
        };

        let plan = model.plan();
        let mut exp_avg = Vec::with_capacity(gathered.len());
        let mut exp_avg_sq = Vec::with_capacity(gathered.len());
        for shard in &gathered {
            let (a, b) = unzip(shard);
            exp_avg.push(a);
            exp_avg_sq.push(b);
        }

        let exp_avg = plan.assemble(&exp_avg).map_err(CollectiveError::Protocol)?;
        let exp_avg_sq = plan
            .assemble(&exp_avg_sq)
            .map_err(CollectiveError::Protocol)?;

        Ok(Some(OptimizerState {
            step: self.step,
            hyper: self.hyper.clone(),
            moments: zip(exp_avg, exp_avg_sq),
        }))
    }

    /// Partition a full optimizer state consistently with the model's
    /// sharding. Rank-collective: only `root` supplies `full`.
    pub fn scatter_full_state<C: Collective>(
        full: Option<OptimizerState>,
        model: &ShardedModel,
        root: usize,
        collective: &C,
    ) -> Result<Self, CollectiveError> {
        let shards = if collective.is_root(root) {
            let full = full.ok_or_else(|| {
                CollectiveError::Protocol("root supplied no optimizer state".into())
            })?;
            Some(split(full, model.plan()).map_err(CollectiveError::Protocol)?)
        } else {
            None
        };

        let shard: OptimizerShard = collective.scatter(root, shards)?;
        Ok(Self {
            hyper: shard.hyper,
            step: shard.step,
            moments: shard.moments,
        })
    }

    pub fn hyper(&self) -> &OptimizerShell {
        &self.hyper
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    pub fn moments(&self) -> &BTreeMap<String, MomentBuffers> {
        &self.moments
    }

    pub fn moments_mut(&mut self) -> &mut BTreeMap<String, MomentBuffers> {
        &mut self.moments
    }
}

fn split(full: OptimizerState, plan: &ShardPlan) -> Result<Vec<OptimizerShard>, String> {
    let (exp_avg, exp_avg_sq) = unzip(&full.moments);
    let exp_avg = plan.split(&exp_avg)?;
    let exp_avg_sq = plan.split(&exp_avg_sq)?;

    Ok(exp_avg
        .into_iter()
        .zip(exp_avg_sq)
        .map(|(a, b)| OptimizerShard {
            step: full.step,
            hyper: full.hyper.clone(),
            moments: zip(a, b),
        })
        .collect())
}

fn unzip(moments: &BTreeMap<String, MomentBuffers>) -> (StateDict, StateDict) {
    let mut exp_avg = StateDict::new();
    let mut exp_avg_sq = StateDict::new();
    for (name, m) in moments {
        exp_avg.insert(name.clone(), m.exp_avg.clone());
        exp_avg_sq.insert(name.clone(), m.exp_avg_sq.clone());
    }
    (exp_avg, exp_avg_sq)
}

fn zip(exp_avg: StateDict, mut exp_avg_sq: StateDict) -> BTreeMap<String, MomentBuffers> {
    exp_avg
        .into_iter()
        .filter_map(|(name, a)| {
            exp_avg_sq.remove(&name).map(|b| {
                (
                    name,
                    MomentBuffers {
                        exp_avg: a,
                        exp_avg_sq: b,
                    },
                )
            })
        })
        .collect()
}
