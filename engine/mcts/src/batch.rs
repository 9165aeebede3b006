//! Mini-batch staging containers.
//!
//! One worker iteration assembles a mini-batch by repeatedly selecting a
//! leaf and filing the result into one of the fixed-capacity containers
//! below. Assembly stops as soon as any container reaches capacity, which
//! bounds both memory and the time until the next network dispatch.

use std::sync::Arc;

use spindle_core::{GamePhase, SideToMove};

use crate::node::Node;
use crate::worker::Trajectory;

/// Capacity-bounded staging vector.
///
/// Push order is preserved; the capacity check drives the batch-assembly
/// loop, so overflowing is a logic error rather than a runtime condition.
pub struct FixedVector<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> FixedVector<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add_element(&mut self, item: T) {
        debug_assert!(!self.is_full(), "staging container overflow");
        self.items.push(item);
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn get(&self, idx: usize) -> &T {
        &self.items[idx]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Drop all elements but keep the allocation.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Per-worker staging for one mini-batch.
///
/// All containers are cleared by the backup pass at the end of each
/// iteration, so an iteration always starts from empty staging.
pub struct BatchStaging {
    /// Newly created leaves awaiting network evaluation.
    pub new_nodes: FixedVector<Arc<Node>>,
    /// Side to move of each staged leaf, aligned with `new_nodes`.
    pub new_node_side_to_move: FixedVector<SideToMove>,
    /// Trajectory of each staged leaf, aligned with `new_nodes`.
    pub new_trajectories: Vec<Trajectory>,
    /// Precomputed backup values for transposition hits.
    pub transposition_values: FixedVector<f32>,
    pub transposition_trajectories: Vec<Trajectory>,
    /// Trajectories that ran into a leaf still awaiting evaluation.
    pub collision_trajectories: Vec<Trajectory>,
    /// Game-phase histogram of the staged leaves, in first-seen order.
    pub phase_counts: Vec<(GamePhase, usize)>,
    /// Network input planes, one slot of `plane_values` floats per staged
    /// leaf.
    pub input_planes: Vec<f32>,
    plane_values: usize,
}

impl BatchStaging {
    pub fn new(batch_size: usize, plane_values: usize) -> Self {
        Self {
            new_nodes: FixedVector::with_capacity(batch_size),
            new_node_side_to_move: FixedVector::with_capacity(batch_size),
            new_trajectories: Vec::with_capacity(batch_size),
            transposition_values: FixedVector::with_capacity(2 * batch_size),
            transposition_trajectories: Vec::with_capacity(2 * batch_size),
            collision_trajectories: Vec::with_capacity(batch_size),
            phase_counts: Vec::new(),
            input_planes: vec![0.0; batch_size * plane_values],
            plane_values,
        }
    }

    /// Input-plane slot for the next staged leaf.
    pub fn next_input_slot(&mut self) -> &mut [f32] {
        let offset = self.new_nodes.len() * self.plane_values;
        &mut self.input_planes[offset..offset + self.plane_values]
    }

    /// Record one staged leaf of the given phase.
    pub fn count_phase(&mut self, phase: GamePhase) {
        if let Some(entry) = self.phase_counts.iter_mut().find(|(p, _)| *p == phase) {
            entry.1 += 1;
        } else {
            self.phase_counts.push((phase, 1));
        }
    }

    /// Phase with the highest count; first-seen order breaks ties. Resets
    /// the histogram for the next batch.
    pub fn take_majority_phase(&mut self) -> Option<GamePhase> {
        let mut best: Option<(GamePhase, usize)> = None;
        for &(phase, count) in &self.phase_counts {
            match best {
                Some((_, best_count)) if count <= best_count => {}
                _ => best = Some((phase, count)),
            }
        }
        self.phase_counts.clear();
        best.map(|(phase, _)| phase)
    }
}
