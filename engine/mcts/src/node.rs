//! Tree node primitive.
//!
//! Nodes are shared between workers behind `Arc`. Edge statistics (prior,
//! visit count, virtual loss, mean Q) live on the parent, guarded by the
//! per-node mutex; scalar state that other workers read lock-free (visit
//! count, value, publication flags, solver state) lives in atomics. Writes
//! to a node's policy and value happen before the `has_nn_results` flag is
//! published, so a reader that observes the flag set may descend without
//! further synchronization.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::{Rng, RngCore};
use spindle_core::{Action, GameState, SideToMove};

use crate::config::{SearchMode, SearchSettings};
use crate::map::TranspositionMap;

/// Index of a child slot within its parent.
pub type ChildIdx = usize;

/// Mean Q assigned to edges that have never been visited.
pub(crate) const Q_VALUE_INIT: f32 = -1.0;

/// An edge Q this close to the canonical value counts as in sync, and the
/// selector descends instead of borrowing the canonical value.
const TRANSPOS_Q_EPSILON: f64 = 1e-3;

/// Checking moves are raised to this fraction of the best prior.
const CHECK_ENHANCE_FLOOR_FRACTION: f32 = 0.1;

/// Solver classification of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Unsolved = 0,
    SolvedWin = 1,
    SolvedLoss = 2,
    SolvedDraw = 3,
    Tablebase = 4,
}

impl NodeType {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => NodeType::SolvedWin,
            2 => NodeType::SolvedLoss,
            3 => NodeType::SolvedDraw,
            4 => NodeType::Tablebase,
            _ => NodeType::Unsolved,
        }
    }
}

/// Whether a search may keep growing below a node of this type.
#[inline]
pub fn is_unsolved_or_tablebase(node_type: NodeType) -> bool {
    matches!(node_type, NodeType::Unsolved | NodeType::Tablebase)
}

/// Mutable node state guarded by the per-node mutex.
pub struct NodeInner {
    /// Actions in policy order once network results arrived.
    pub(crate) actions: Vec<Action>,
    pub(crate) priors: Vec<f32>,
    /// Per-edge visit counts, including pending virtual losses.
    pub(crate) child_visits: Vec<u32>,
    pub(crate) child_virtual_loss: Vec<u32>,
    /// Mean action value per edge from this node's perspective.
    pub(crate) q_values: Vec<f32>,
    pub(crate) children: Vec<Option<Arc<Node>>>,
    /// Which actions give check. Empty unless check enhancement is on.
    pub(crate) checks: Vec<bool>,
    /// First child index not yet scheduled for a visit.
    pub(crate) no_visit_idx: usize,
    /// Whether the check probe has already scanned this node.
    pub(crate) was_inspected: bool,
}

impl NodeInner {
    #[inline]
    pub fn num_children(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn action(&self, idx: ChildIdx) -> Action {
        self.actions[idx]
    }

    #[inline]
    pub fn child(&self, idx: ChildIdx) -> Option<Arc<Node>> {
        self.children[idx].clone()
    }

    #[inline]
    pub fn is_fully_expanded(&self) -> bool {
        self.no_visit_idx >= self.actions.len()
    }

    fn renormalize_priors(&mut self) {
        let sum: f32 = self.priors.iter().sum();
        if sum > 0.0 {
            for p in &mut self.priors {
                *p /= sum;
            }
        } else if !self.priors.is_empty() {
            let uniform = 1.0 / self.priors.len() as f32;
            self.priors.fill(uniform);
        }
    }
}

/// A position in the shared search tree.
pub struct Node {
    hash: u64,
    side_to_move: SideToMove,
    is_terminal: bool,
    visits: AtomicU32,
    value_bits: AtomicU32,
    has_nn_results: AtomicBool,
    is_transposition: AtomicBool,
    node_type: AtomicU8,
    inner: Mutex<NodeInner>,
}

impl Node {
    /// Build a node for `state`. Terminal positions come out solved, carry
    /// their game-theoretic value and count as playout nodes immediately.
    pub fn from_state(state: &dyn GameState, settings: &SearchSettings) -> Self {
        let terminal = state.terminal();
        let is_terminal = terminal.is_terminal();
        let actions = if is_terminal {
            Vec::new()
        } else {
            state.legal_actions()
        };
        let n = actions.len();
        let checks = if settings.enhance_checks && !is_terminal {
            actions.iter().map(|&a| state.gives_check(a)).collect()
        } else {
            Vec::new()
        };
        let node_type = match terminal {
            spindle_core::TerminalKind::Win => NodeType::SolvedWin,
            spindle_core::TerminalKind::Loss => NodeType::SolvedLoss,
            spindle_core::TerminalKind::Draw => NodeType::SolvedDraw,
            spindle_core::TerminalKind::None => NodeType::Unsolved,
        };

        Self {
            hash: state.hash_key(),
            side_to_move: state.side_to_move(),
            is_terminal,
            visits: AtomicU32::new(0),
            value_bits: AtomicU32::new(terminal.value().to_bits()),
            has_nn_results: AtomicBool::new(is_terminal),
            is_transposition: AtomicBool::new(false),
            node_type: AtomicU8::new(node_type as u8),
            inner: Mutex::new(NodeInner {
                actions,
                // Uniform until a policy arrives; rollout-mode nodes keep
                // this so the exploration term stays live.
                priors: vec![if n > 0 { 1.0 / n as f32 } else { 0.0 }; n],
                child_visits: vec![0; n],
                child_virtual_loss: vec![0; n],
                q_values: vec![Q_VALUE_INIT; n],
                children: (0..n).map(|_| None).collect(),
                checks,
                no_visit_idx: 0,
                was_inspected: false,
            }),
        }
    }

    /// Acquire the per-node lock. All edge mutation goes through the
    /// returned guard.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, NodeInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[inline]
    pub fn hash_key(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub fn side_to_move(&self) -> SideToMove {
        self.side_to_move
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.is_terminal
    }

    #[inline]
    pub fn visits(&self) -> u32 {
        self.visits.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn increment_visits(&self) {
        self.visits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn value(&self) -> f32 {
        f32::from_bits(self.value_bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_value(&self, value: f32) {
        self.value_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Publication point: all policy and value writes must precede this.
    #[inline]
    pub fn enable_has_nn_results(&self) {
        self.has_nn_results.store(true, Ordering::Release);
    }

    #[inline]
    pub fn has_nn_results(&self) -> bool {
        self.has_nn_results.load(Ordering::Acquire)
    }

    /// A playout node has a completed evaluation and may be descended.
    #[inline]
    pub fn is_playout_node(&self) -> bool {
        self.has_nn_results()
    }

    #[inline]
    pub fn is_transposition(&self) -> bool {
        self.is_transposition.load(Ordering::Relaxed)
    }

    #[inline]
    fn mark_transposition(&self) {
        self.is_transposition.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn node_type(&self) -> NodeType {
        NodeType::from_u8(self.node_type.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_node_type(&self, node_type: NodeType) {
        self.node_type.store(node_type as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_tablebase(&self) -> bool {
        self.node_type() == NodeType::Tablebase
    }

    /// Mark this node as a tablebase position with a known value.
    pub fn set_tablebase(&self, value: f32) {
        self.set_value(value);
        self.set_node_type(NodeType::Tablebase);
    }

    #[inline]
    pub fn number_of_children(&self) -> usize {
        self.lock().num_children()
    }

    #[inline]
    pub fn get_child_node(&self, idx: ChildIdx) -> Option<Arc<Node>> {
        self.lock().child(idx)
    }

    #[inline]
    pub fn get_no_visit_idx(&self) -> usize {
        self.lock().no_visit_idx
    }

    /// Advance `no_visit_idx` by one, clamped to the number of children.
    #[inline]
    pub fn increment_no_visit_idx(&self, inner: &mut NodeInner) {
        inner.no_visit_idx = (inner.no_visit_idx + 1).min(inner.actions.len());
    }

    /// PUCT selection over the dispatched window.
    ///
    /// Children are kept in descending prior order, so the best unvisited
    /// candidate is always the one at `no_visit_idx`; scanning past it would
    /// only ever find worse unvisited children.
    pub fn select_child_node(&self, inner: &NodeInner, settings: &SearchSettings) -> ChildIdx {
        let n = inner.actions.len();
        debug_assert!(n > 0, "selection on a childless node");
        let limit = (inner.no_visit_idx + 1).min(n);
        let sqrt_parent = (self.visits() as f32).sqrt();

        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for idx in 0..limit {
            let u = settings.c_puct * inner.priors[idx] * sqrt_parent
                / (1.0 + inner.child_visits[idx] as f32);
            let score = inner.q_values[idx] + u;
            if score > best_score {
                best_score = score;
                best = idx;
            }
        }
        best
    }

    /// Reserve the edge for an in-flight evaluation: the virtual-loss
    /// quantum is folded in as that many lost visits, biasing concurrent
    /// selection away until the matching backup reverts it.
    pub fn apply_virtual_loss_to_child(
        &self,
        inner: &mut NodeInner,
        idx: ChildIdx,
        settings: &SearchSettings,
    ) {
        let vl = settings.virtual_loss;
        let total = inner.child_visits[idx];
        let new_total = total + vl;
        inner.q_values[idx] =
            (inner.q_values[idx] * total as f32 - vl as f32) / new_total as f32;
        inner.child_visits[idx] = new_total;
        inner.child_virtual_loss[idx] += vl;
    }

    /// Revert one virtual-loss quantum and fold in a real visit with
    /// `value` (already from this node's perspective).
    pub(crate) fn revert_virtual_loss_and_backup(
        &self,
        inner: &mut NodeInner,
        idx: ChildIdx,
        value: f32,
        settings: &SearchSettings,
    ) {
        let vl = settings.virtual_loss;
        let total = inner.child_visits[idx];
        debug_assert!(total >= vl && inner.child_virtual_loss[idx] >= vl);
        let new_total = total - vl + 1;
        inner.q_values[idx] =
            (inner.q_values[idx] * total as f32 + vl as f32 + value) / new_total as f32;
        inner.child_visits[idx] = new_total;
        inner.child_virtual_loss[idx] -= vl;
    }

    /// Revert one virtual-loss quantum without contributing a value. Used
    /// for collision trajectories so in-flight evaluations are not counted
    /// twice.
    pub(crate) fn revert_virtual_loss(
        &self,
        inner: &mut NodeInner,
        idx: ChildIdx,
        settings: &SearchSettings,
    ) {
        let vl = settings.virtual_loss;
        let total = inner.child_visits[idx];
        debug_assert!(total >= vl && inner.child_virtual_loss[idx] >= vl);
        let new_total = total - vl;
        inner.q_values[idx] = if new_total == 0 {
            Q_VALUE_INIT
        } else {
            (inner.q_values[idx] * total as f32 + vl as f32) / new_total as f32
        };
        inner.child_visits[idx] = new_total;
        inner.child_virtual_loss[idx] -= vl;
    }

    /// Edge visits with pending virtual losses removed.
    #[inline]
    pub fn get_real_visits(&self, inner: &NodeInner, idx: ChildIdx) -> u32 {
        inner.child_visits[idx] - inner.child_virtual_loss[idx]
    }

    /// Reconstruct the virtual-loss-free mean Q of an edge. `real_visits`
    /// must be the matching `get_real_visits` result and non-zero.
    pub fn get_transposition_q_value(
        &self,
        inner: &NodeInner,
        idx: ChildIdx,
        real_visits: u32,
    ) -> f64 {
        debug_assert!(real_visits > 0);
        let total = inner.child_visits[idx] as f64;
        let virtual_sum = inner.child_virtual_loss[idx] as f64;
        (inner.q_values[idx] as f64 * total + virtual_sum) / real_visits as f64
    }

    /// Whether this canonical node's value is worth borrowing for an edge
    /// whose reconstructed Q is `transpos_q`. Once the edge is in sync the
    /// selector descends normally instead.
    pub fn is_transposition_return(&self, transpos_q: f64) -> bool {
        self.has_nn_results() && (self.value() as f64 - transpos_q).abs() > TRANSPOS_Q_EPSILON
    }

    /// Attach the child at `idx`, either by linking an existing canonical
    /// node for the same position (a transposition) or by inserting a fresh
    /// node. Returns the attached node and whether it was a transposition.
    pub fn add_new_node_to_tree(
        &self,
        inner: &mut NodeInner,
        map: &TranspositionMap,
        state: &dyn GameState,
        idx: ChildIdx,
        settings: &SearchSettings,
    ) -> (Arc<Node>, bool) {
        let use_map =
            settings.search_mode == SearchMode::Neural || settings.use_transposition_table;
        let (node, transposition) = if use_map {
            map.lookup_or_insert_with(state.hash_key(), || {
                Arc::new(Node::from_state(state, settings))
            })
        } else {
            let node = Arc::new(Node::from_state(state, settings));
            map.count_node();
            (node, false)
        };
        if transposition {
            node.mark_transposition();
        }
        inner.children[idx] = Some(node.clone());
        (node, transposition)
    }

    /// Assign the network policy to this node's actions, renormalize over
    /// the legal moves and order children by descending prior.
    ///
    /// Must run before any child is dispatched; the joint sort relies on
    /// all edge statistics still being at their initial values.
    pub fn set_probabilities_for_moves(
        &self,
        inner: &mut NodeInner,
        policy: &[f32],
        mirror: bool,
    ) {
        debug_assert_eq!(inner.no_visit_idx, 0);
        let n = inner.actions.len();
        for i in 0..n {
            let action = inner.actions[i] as usize;
            let idx = if mirror { policy.len() - 1 - action } else { action };
            inner.priors[i] = policy[idx].max(0.0);
        }
        inner.renormalize_priors();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            inner.priors[b]
                .partial_cmp(&inner.priors[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        inner.actions = order.iter().map(|&i| inner.actions[i]).collect();
        inner.priors = order.iter().map(|&i| inner.priors[i]).collect();
        if !inner.checks.is_empty() {
            inner.checks = order.iter().map(|&i| inner.checks[i]).collect();
        }
    }

    /// Raise the prior of checking moves to the enhancement floor.
    pub fn enhance_moves(&self, inner: &mut NodeInner, settings: &SearchSettings) {
        if !settings.enhance_checks || inner.checks.is_empty() {
            return;
        }
        let max_prior = inner.priors.iter().cloned().fold(0.0f32, f32::max);
        if max_prior <= 0.0 {
            return;
        }
        let floor = CHECK_ENHANCE_FLOOR_FRACTION * max_prior;
        let mut changed = false;
        for i in 0..inner.checks.len() {
            if inner.checks[i] && inner.priors[i] < floor {
                inner.priors[i] = floor;
                changed = true;
            }
        }
        if changed {
            inner.renormalize_priors();
        }
    }

    /// Sharpen or flatten the prior policy with a power transform.
    pub fn apply_temperature_to_prior_policy(&self, inner: &mut NodeInner, temperature: f32) {
        if temperature <= 0.0 || (temperature - 1.0).abs() < f32::EPSILON {
            return;
        }
        let inv = 1.0 / temperature;
        for p in &mut inner.priors {
            *p = p.powf(inv);
        }
        inner.renormalize_priors();
    }

    /// Pick the edge for a random playout step.
    ///
    /// On a fully expanded node a child is drawn uniformly; the draw is kept
    /// when the child is missing, not yet evaluated or unsolved, otherwise
    /// the caller falls back to normal selection (`None`). On a partially
    /// expanded node the next undispatched child is scheduled.
    pub fn random_playout(
        &self,
        inner: &mut NodeInner,
        rng: &mut dyn RngCore,
    ) -> Option<ChildIdx> {
        let n = inner.actions.len();
        if n == 0 {
            return None;
        }
        if inner.is_fully_expanded() {
            let idx = rng.gen_range(0..n);
            match &inner.children[idx] {
                None => Some(idx),
                Some(child) if !child.is_playout_node() => Some(idx),
                Some(child) if child.node_type() == NodeType::Unsolved => Some(idx),
                Some(_) => None,
            }
        } else {
            let idx = inner.no_visit_idx.min(n - 1);
            self.increment_no_visit_idx(inner);
            Some(idx)
        }
    }
}

/// Backup value that moves an edge's Q to exactly the canonical node's
/// value: with `n` real visits at mean `q`, one more visit of
/// `(n + 1) * value - n * q` leaves the mean at `value`.
pub fn get_transposition_backup_value(real_visits: u32, transpos_q: f64, value: f32) -> f32 {
    ((real_visits + 1) as f64 * value as f64 - real_visits as f64 * transpos_q) as f32
}
