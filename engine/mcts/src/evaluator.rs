//! Network evaluation seam.
//!
//! The search only needs a batched forward pass: it packs input planes for
//! a mini-batch of positions and receives one value per position plus one
//! policy vector over the global action space. `predict` is infallible by
//! contract; an inference failure is a precondition violation of the
//! implementation, not a state the search handles.

use thiserror::Error;

/// Errors raised while constructing an evaluator or loading a model.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("model shape mismatch: {0}")]
    ShapeMismatch(String),
}

/// Batched policy/value network.
///
/// Implementations must be callable from multiple worker threads; the
/// driver serializes calls per instance or hands each worker its own
/// instance.
pub trait NeuralNetApi: Send + Sync {
    /// Run one forward pass.
    ///
    /// `input_planes` holds `batch * nb_input_values_total()` floats,
    /// `value_outputs` receives `batch` values in `[-1, 1]` and
    /// `prob_outputs` receives `batch * policy_size()` policy entries
    /// indexed by action id.
    fn predict(&self, input_planes: &[f32], value_outputs: &mut [f32], prob_outputs: &mut [f32]);

    /// Whether the policy head is indexed by global action id. The search
    /// requires this layout.
    fn is_policy_map(&self) -> bool;

    /// Floats one position occupies in `input_planes`.
    fn nb_input_values_total(&self) -> usize;

    /// Length of one policy vector.
    fn policy_size(&self) -> usize;

    /// Network version tag, forwarded to plane encoding where games need it.
    fn version(&self) -> u32;
}

/// Evaluator returning a uniform policy and neutral values.
///
/// Useful for tests and as a baseline: the search degrades to visit-count
/// driven exploration.
#[derive(Debug, Clone)]
pub struct UniformNet {
    plane_values: usize,
    policy_len: usize,
}

impl UniformNet {
    pub fn new(plane_values: usize, policy_len: usize) -> Self {
        Self {
            plane_values,
            policy_len,
        }
    }
}

impl NeuralNetApi for UniformNet {
    fn predict(&self, input_planes: &[f32], value_outputs: &mut [f32], prob_outputs: &mut [f32]) {
        let batch = value_outputs.len();
        debug_assert_eq!(input_planes.len(), batch * self.plane_values);
        debug_assert_eq!(prob_outputs.len(), batch * self.policy_len);

        value_outputs.fill(0.0);
        prob_outputs.fill(1.0 / self.policy_len as f32);
    }

    fn is_policy_map(&self) -> bool {
        true
    }

    fn nb_input_values_total(&self) -> usize {
        self.plane_values
    }

    fn policy_size(&self) -> usize {
        self.policy_len
    }

    fn version(&self) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_net_fills_a_batch() {
        let net = UniformNet::new(4, 5);
        let input = vec![0.0f32; 3 * 4];
        let mut values = vec![9.9f32; 3];
        let mut probs = vec![9.9f32; 3 * 5];

        net.predict(&input, &mut values, &mut probs);

        assert!(values.iter().all(|&v| v == 0.0));
        for &p in &probs {
            assert!((p - 0.2).abs() < 1e-6);
        }
        assert!(net.is_policy_map());
        assert_eq!(net.nb_input_values_total(), 4);
        assert_eq!(net.policy_size(), 5);
    }
}
