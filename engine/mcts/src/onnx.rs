//! ONNX Runtime implementation of the network seam.
//!
//! Loads a model exported by the trainer and serves batched forward
//! passes. The model is expected to take a `(batch, plane_values)` float
//! input named "planes" and produce "policy" `(batch, policy_size)` and
//! "value" `(batch, 1)` outputs, with the policy head indexed by global
//! action id.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ort::{session::Session, value::Value};
use tracing::debug;

use crate::evaluator::{EvaluatorError, NeuralNetApi};

/// `ort` session wrapper.
///
/// `Session::run` needs `&mut self`, so the session sits behind a mutex;
/// workers holding their own `OnnxNet` instances avoid the contention.
pub struct OnnxNet {
    session: Mutex<Session>,
    plane_values: usize,
    policy_len: usize,
    version: u32,
    inference_count: AtomicU64,
}

impl std::fmt::Debug for OnnxNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxNet")
            .field("plane_values", &self.plane_values)
            .field("policy_len", &self.policy_len)
            .finish_non_exhaustive()
    }
}

impl OnnxNet {
    /// Load a model from disk.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        plane_values: usize,
        policy_len: usize,
        version: u32,
    ) -> Result<Self, EvaluatorError> {
        let session = Session::builder()
            .map_err(|e| EvaluatorError::ModelLoad(format!("session builder: {e}")))?
            .with_intra_threads(1)
            .map_err(|e| EvaluatorError::ModelLoad(format!("intra threads: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| EvaluatorError::ModelLoad(format!("model file: {e}")))?;

        Ok(Self {
            session: Mutex::new(session),
            plane_values,
            policy_len,
            version,
            inference_count: AtomicU64::new(0),
        })
    }

    /// Load a model held in memory.
    pub fn load_from_memory(
        model_data: &[u8],
        plane_values: usize,
        policy_len: usize,
        version: u32,
    ) -> Result<Self, EvaluatorError> {
        let session = Session::builder()
            .map_err(|e| EvaluatorError::ModelLoad(format!("session builder: {e}")))?
            .with_intra_threads(1)
            .map_err(|e| EvaluatorError::ModelLoad(format!("intra threads: {e}")))?
            .commit_from_memory(model_data)
            .map_err(|e| EvaluatorError::ModelLoad(format!("model bytes: {e}")))?;

        Ok(Self {
            session: Mutex::new(session),
            plane_values,
            policy_len,
            version,
            inference_count: AtomicU64::new(0),
        })
    }
}

impl NeuralNetApi for OnnxNet {
    // `predict` is infallible by contract: a model whose shapes do not
    // match what `load` was told, or a runtime inference failure, is a
    // precondition violation and panics.
    fn predict(&self, input_planes: &[f32], value_outputs: &mut [f32], prob_outputs: &mut [f32]) {
        let batch = value_outputs.len();
        assert_eq!(input_planes.len(), batch * self.plane_values);
        assert_eq!(prob_outputs.len(), batch * self.policy_len);

        let input_array =
            ndarray::Array2::from_shape_vec((batch, self.plane_values), input_planes.to_vec())
                .expect("input plane buffer matches the declared shape");
        let input_value =
            Value::from_array(input_array).expect("input tensor construction cannot fail");

        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outputs = session
            .run(ort::inputs!["planes" => input_value])
            .expect("inference must succeed");

        let policy_output = outputs
            .get("policy")
            .expect("model exposes a policy output");
        let (_shape, policy_data) = policy_output
            .try_extract_tensor::<f32>()
            .expect("policy output is a float tensor");
        prob_outputs.copy_from_slice(&policy_data[..batch * self.policy_len]);

        let value_output = outputs.get("value").expect("model exposes a value output");
        let (_shape, value_data) = value_output
            .try_extract_tensor::<f32>()
            .expect("value output is a float tensor");
        value_outputs.copy_from_slice(&value_data[..batch]);
        drop(session);

        let count = self.inference_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 10_000 == 0 {
            debug!(count, "onnx inference calls");
        }
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
        self.version
    }
}
