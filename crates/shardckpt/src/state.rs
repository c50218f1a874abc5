//! State dictionaries: named host tensors.

use ndarray::ArrayD;
use std::collections::BTreeMap;

/// Host-memory tensor.
pub type Tensor = ArrayD<f32>;

/// Parameter or state name mapped to its tensor, ordered by name so every
/// rank walks the same sequence.
pub type StateDict = BTreeMap<String, Tensor>;

/// Parameter name mapped to its full (unsharded) shape.
pub type ParamSpecs = BTreeMap<String, Vec<usize>>;

/// Number of elements in a tensor of the given shape.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Shapes of every tensor in a state dict.
pub fn specs_of(state: &StateDict) -> ParamSpecs {
    state
        .iter()
        .map(|(name, tensor)| (name.clone(), tensor.shape().to_vec()))
        .collect()
}

/// Check that `state` holds exactly the parameters in `specs`, with matching shapes.
pub fn check_state(state: &StateDict, specs: &ParamSpecs) -> Result<(), String> {
    for name in specs.keys() {
        if !state.contains_key(name) {
            return Err(format!("missing key '{}'", name));
        }
    }

    for (name, tensor) in state {
        match specs.get(name) {
            None => return Err(format!("unexpected key '{}'", name)),
            Some(shape) if tensor.shape() != shape.as_slice() => {
                return Err(format!(
                    "shape mismatch for '{}': expected {:?}, got {:?}",
                    name,
                    shape,
                    tensor.shape()
                ));
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Total number of elements across a state dict.
pub fn total_elements(state: &StateDict) -> usize {
    state.values().map(|t| t.len()).sum()
}
