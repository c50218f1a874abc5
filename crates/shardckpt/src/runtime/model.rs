//! Model handles: the unsharded shell and the per-rank sharded model.

use super::plan::ShardPlan;
use crate::distributed::{Collective, CollectiveError};
use crate::state::{check_state, specs_of, ParamSpecs, StateDict};
use crate::RestoreError;
use ndarray::{ArrayD, IxDyn};

/// Unsharded model instance. Every rank knows the parameter shapes; only the
/// aggregator's values matter when the shell is sharded.
#[derive(Clone, Debug)]
pub struct ModelShell {
    specs: ParamSpecs,
    state: StateDict,
}

impl ModelShell {
    /// Zero-initialized shell with the given parameter shapes.
    pub fn new(specs: ParamSpecs) -> Self {
        let state = specs
            .iter()
            .map(|(name, shape)| (name.clone(), ArrayD::zeros(IxDyn(shape))))
            .collect();
        Self { specs, state }
    }

    /// Shell holding an existing full state.
    pub fn from_state(state: StateDict) -> Self {
        Self {
            specs: specs_of(&state),
            state,
        }
    }

    pub fn specs(&self) -> &ParamSpecs {
        &self.specs
    }

    pub fn state(&self) -> &StateDict {
        &self.state
    }

    /// Replace the shell's parameters. Keys and shapes must match exactly.
    pub fn load_state_dict(&mut self, state: StateDict) -> Result<(), RestoreError> {
        check_state(&state, &self.specs).map_err(RestoreError::StateMismatch)?;
        self.state = state;
        Ok(())
    }
}

/// This rank's shard of the model.
#[derive(Clone, Debug)]
pub struct ShardedModel {
    plan: ShardPlan,
    rank: usize,
    params: StateDict,
}

impl ShardedModel {
    /// Partition the shell across all ranks. Rank-collective: the shell values
    /// on `root` are the source of truth; every rank gets its local shard.
    pub fn scatter_full_state<C: Collective>(
        shell: ModelShell,
        root: usize,
        collective: &C,
    ) -> Result<Self, CollectiveError> {
        let plan = ShardPlan::new(shell.specs, collective.world_size());

        let shards = if collective.is_root(root) {
            Some(plan.split(&shell.state).map_err(CollectiveError::Protocol)?)
        } else {
            None
        };
        let params: StateDict = collective.scatter(root, shards)?;

        tracing::debug!(
            rank = collective.rank(),
            elements = plan.local_elements(collective.rank()),
            "Model shard assigned"
        );

        Ok(Self {
            plan,
            rank: collective.rank(),
            params,
        })
    }

    /// Collect the full parameter set onto `root`. Rank-collective: returns
    /// `Some` on `root` only.
    pub fn gather_full_state<C: Collective>(
        &self,
        root: usize,
        collective: &C,
    ) -> Result<Option<StateDict>, CollectiveError> {
        match collective.gather(root, &self.params)? {
            Some(shards) => Ok(Some(
                self.plan
                    .assemble(&shards)
                    .map_err(CollectiveError::Protocol)?,
            )),
            None => Ok(None),
        }
    }

    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn params(&self) -> &StateDict {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut StateDict {
        &mut self.params
    }

    /// Whether this handle was sharded for the given topology.
    pub fn is_sharded_for(&self, rank: usize, world_size: usize) -> bool {
        self.rank == rank && self.plan.world_size() == world_size
    }
}
