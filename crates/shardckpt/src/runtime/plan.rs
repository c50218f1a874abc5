//! Flat parameter partitioning.
//!
//! Each parameter is flattened in logical (row-major) order and cut into
//! `world_size` contiguous chunks of `ceil(numel / world_size)` elements; the
//! trailing ranks may hold short or empty chunks. Shards are stored as 1-D
//! tensors. Because the plan depends only on the parameter shapes and the world
//! size, a full state can be re-partitioned for any rank count.

use crate::state::{numel, ParamSpecs, StateDict, Tensor};
use ndarray::{Array1, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Sharding plan for one world size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlan {
    world_size: usize,
    specs: ParamSpecs,
}

impl ShardPlan {
    /// Create a plan over `world_size` ranks.
    pub fn new(specs: ParamSpecs, world_size: usize) -> Self {
        assert!(world_size > 0, "World size must be > 0");
        Self { world_size, specs }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn specs(&self) -> &ParamSpecs {
        &self.specs
    }

    /// Flat element range of `name` held by `rank`.
    pub fn range(&self, name: &str, rank: usize) -> Option<Range<usize>> {
        let shape = self.specs.get(name)?;
        Some(chunk_range(numel(shape), self.world_size, rank))
    }

    /// Number of elements `rank` holds across all parameters.
    pub fn local_elements(&self, rank: usize) -> usize {
        self.specs
            .values()
            .map(|shape| chunk_range(numel(shape), self.world_size, rank).len())
            .sum()
    }

    /// Cut a full state into one shard dict per rank. `full` must already have
    /// been checked against the plan's specs.
    pub fn split(&self, full: &StateDict) -> Result<Vec<StateDict>, String> {
        let mut shards = vec![StateDict::new(); self.world_size];

        for (name, shape) in &self.specs {
            let tensor = full
                .get(name)
                .ok_or_else(|| format!("missing key '{}'", name))?;
            let n = numel(shape);
            if tensor.len() != n {
                return Err(format!(
                    "'{}' has {} elements, plan expects {}",
                    name,
                    tensor.len(),
                    n
                ));
            }

            let flat: Vec<f32> = tensor.iter().copied().collect();
            for (rank, shard) in shards.iter_mut().enumerate() {
                let range = chunk_range(n, self.world_size, rank);
                shard.insert(name.clone(), flat_tensor(flat[range].to_vec()));
            }
        }

        Ok(shards)
    }

    /// Reassemble full tensors from one shard dict per rank (in rank order).
    pub fn assemble(&self, shards: &[StateDict]) -> Result<StateDict, String> {
        if shards.len() != self.world_size {
            return Err(format!(
                "expected {} shards, got {}",
                self.world_size,
                shards.len()
            ));
        }

        let mut full = StateDict::new();
        for (name, shape) in &self.specs {
            let n = numel(shape);
            let mut flat = Vec::with_capacity(n);

            for (rank, shard) in shards.iter().enumerate() {
                let piece = shard
                    .get(name)
                    .ok_or_else(|| format!("rank {} is missing shard '{}'", rank, name))?;
                let expected = chunk_range(n, self.world_size, rank).len();
                if piece.len() != expected {
                    return Err(format!(
                        "rank {} holds {} elements of '{}', plan expects {}",
                        rank,
                        piece.len(),
                        name,
                        expected
                    ));
                }
                flat.extend(piece.iter().copied());
            }

            let tensor = ArrayD::from_shape_vec(IxDyn(shape), flat)
                .map_err(|e| format!("cannot reshape '{}': {}", name, e))?;
            full.insert(name.clone(), tensor);
        }

        Ok(full)
    }

    /// Zero-filled local shards for `rank`.
    pub fn zeros(&self, rank: usize) -> StateDict {
        self.specs
            .iter()
            .map(|(name, shape)| {
                let len = chunk_range(numel(shape), self.world_size, rank).len();
                (name.clone(), flat_tensor(vec![0.0; len]))
            })
            .collect()
    }
}

fn chunk_range(numel: usize, world_size: usize, rank: usize) -> Range<usize> {
    let chunk = numel.div_ceil(world_size);
    let start = (rank * chunk).min(numel);
    let end = ((rank + 1) * chunk).min(numel);
    start..end
}

pub(crate) fn flat_tensor(data: Vec<f32>) -> Tensor {
    Array1::from_vec(data).into_dyn()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> ParamSpecs {
        let mut specs = ParamSpecs::new();
        specs.insert("w".into(), vec![2, 5]);
        specs.insert("b".into(), vec![3]);
        specs
    }

    fn full() -> StateDict {
        let mut s = StateDict::new();
        s.insert(
            "w".into(),
            ArrayD::from_shape_vec(IxDyn(&[2, 5]), (0..10).map(|x| x as f32).collect()).unwrap(),
        );
        s.insert(
            "b".into(),
            ArrayD::from_shape_vec(IxDyn(&[3]), vec![-1.0, -2.0, -3.0]).unwrap(),
        );
        s
    }

    #[test]
    fn test_chunk_ranges_cover_all_elements() {
        assert_eq!(chunk_range(10, 4, 0), 0..3);
        assert_eq!(chunk_range(10, 4, 3), 9..10);
        assert_eq!(chunk_range(3, 4, 3), 3..3);
        assert_eq!(chunk_range(0, 2, 1), 0..0);
    }

    #[test]
    fn test_split_and_assemble() {
        let plan = ShardPlan::new(specs(), 3);
        let shards = plan.split(&full()).unwrap();

        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0]["w"].as_slice().unwrap(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(shards[2]["w"].as_slice().unwrap(), &[8.0, 9.0]);
        assert_eq!(shards[2]["b"].as_slice().unwrap(), &[-3.0]);

        assert_eq!(plan.assemble(&shards).unwrap(), full());
    }

    #[test]
    fn test_more_ranks_than_elements() {
        let plan = ShardPlan::new(specs(), 8);
        let shards = plan.split(&full()).unwrap();
        assert_eq!(shards[7]["b"].len(), 0);
        assert_eq!(plan.assemble(&shards).unwrap(), full());
        assert_eq!((0..8).map(|r| plan.local_elements(r)).sum::<usize>(), 13);
    }

    #[test]
    fn test_assemble_rejects_wrong_shard_sizes() {
        let plan = ShardPlan::new(specs(), 2);
        let mut shards = plan.split(&full()).unwrap();
        shards[1].insert("b".into(), flat_tensor(vec![0.0; 5]));
        assert!(plan.assemble(&shards).is_err());
        assert!(plan.assemble(&shards[..1]).is_err());
    }

    #[test]
    fn test_zeros_match_ranges() {
        let plan = ShardPlan::new(specs(), 4);
        let z = plan.zeros(1);
        assert_eq!(z["w"].len(), plan.range("w", 1).unwrap().len());
        assert!(plan.range("missing", 0).is_none());
    }
}
