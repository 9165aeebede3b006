//! Parallel Monte-Carlo Tree Search workers with batched network
//! evaluation.
//!
//! Several [`SearchWorker`]s, one per OS thread, grow a single tree rooted
//! at a shared [`Node`]. Each worker iteration walks the tree under PUCT
//! selection with virtual loss, collects leaves into a mini-batch, runs one
//! network forward pass and backs the results up:
//!
//! ```text
//! select -> expand -> stage        (repeat until a capacity trips)
//!        -> predict (one batch)
//!        -> backup: new leaves, transposition borrows, collisions
//! ```
//!
//! Leaves come in four kinds. Terminal positions back up their exact value
//! immediately. Positions already represented by a canonical node in the
//! [`TranspositionMap`] borrow its value instead of duplicating the
//! subtree. Leaves whose evaluation is still in flight on another worker
//! are collisions: only their virtual loss is reverted, so concurrent
//! workers spread over the tree without double-counting. Everything else is
//! staged for the batched [`NeuralNetApi`] call.
//!
//! The worker loop itself is infallible: all failure modes are in-band leaf
//! kinds, and the driver stops cleanly on [`SearchLimits`] or a solved
//! root. Game rules enter through the `spindle-core` `GameState` trait;
//! evaluation enters through [`NeuralNetApi`] (an `ort`-backed
//! implementation is available behind the `onnx` feature).

pub mod backup;
pub mod batch;
pub mod config;
pub mod evaluator;
pub mod map;
pub mod node;
pub mod worker;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(test)]
pub(crate) mod testutil;

pub use batch::{BatchStaging, FixedVector};
pub use config::{SearchLimits, SearchMode, SearchPlayerMode, SearchSettings};
pub use evaluator::{EvaluatorError, NeuralNetApi, UniformNet};
pub use map::TranspositionMap;
pub use node::{
    get_transposition_backup_value, is_unsolved_or_tablebase, ChildIdx, Node, NodeInner, NodeType,
};
pub use worker::{evaluate_root, NodeBackup, NodeDescription, SearchWorker, Trajectory};

#[cfg(feature = "onnx")]
pub use onnx::OnnxNet;
