//! Search worker: one OS thread growing the shared tree.
//!
//! Each iteration assembles a mini-batch by walking the tree from the root
//! to a leaf under PUCT selection with virtual loss, expanding empty child
//! slots by replaying actions from the root state. Terminal leaves back up
//! immediately; transposition hits borrow the canonical node's value;
//! leaves whose evaluation is still pending elsewhere are filed as
//! collisions. Once a capacity limit trips, one batched network call
//! evaluates the staged leaves and all recorded trajectories are backed up,
//! reverting every virtual loss applied during selection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, trace};

use spindle_core::{GamePhase, GameState};

use crate::backup::{backup_collision, backup_value};
use crate::batch::BatchStaging;
use crate::config::{SearchLimits, SearchMode, SearchSettings};
use crate::evaluator::NeuralNetApi;
use crate::map::TranspositionMap;
use crate::node::{
    get_transposition_backup_value, is_unsolved_or_tablebase, ChildIdx, Node, NodeInner, NodeType,
};

/// Path taken by one selection pass, one (node, child index) entry per
/// edge. Created during selection, consumed by exactly one backup.
pub type Trajectory = Vec<(Arc<Node>, ChildIdx)>;

/// Initial capacity of the per-iteration path buffers.
const DEPTH_INIT: usize = 128;

/// Classification of one selected leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBackup {
    /// Fresh leaf staged for evaluation.
    NewNode,
    /// Leaf with an exact game-theoretic value.
    Terminal,
    /// Edge into a canonical node whose value was borrowed.
    Transposition,
    /// Leaf still awaiting another worker's evaluation.
    Collision,
}

/// Outcome of one selection pass.
#[derive(Debug, Clone, Copy)]
pub struct NodeDescription {
    pub depth: usize,
    pub kind: NodeBackup,
}

/// A single search worker. Many workers may share one root, transposition
/// map and set of networks; everything else here is worker-private.
pub struct SearchWorker {
    root_node: Arc<Node>,
    root_state: Box<dyn GameState>,
    map: Arc<TranspositionMap>,
    nets: Vec<Arc<dyn NeuralNetApi>>,
    phase_to_net: HashMap<GamePhase, usize>,
    settings: SearchSettings,
    limits: SearchLimits,
    running: Arc<AtomicBool>,
    rng: ChaCha20Rng,

    trajectory_buffer: Trajectory,
    actions_buffer: Vec<spindle_core::Action>,
    staging: BatchStaging,
    value_outputs: Vec<f32>,
    prob_outputs: Vec<f32>,

    tb_hits: u64,
    depth_sum: u64,
    depth_max: usize,
    visits_pre_search: u32,
}

impl SearchWorker {
    /// Build a worker over a shared root. `nets` may be empty only in
    /// rollout mode. The seed makes single-worker searches reproducible.
    pub fn new(
        root_node: Arc<Node>,
        root_state: Box<dyn GameState>,
        map: Arc<TranspositionMap>,
        nets: Vec<Arc<dyn NeuralNetApi>>,
        settings: SearchSettings,
        limits: SearchLimits,
        seed: u64,
    ) -> Self {
        debug_assert!(settings.search_mode == SearchMode::Rollout || !nets.is_empty());
        let plane_values = nets.first().map(|n| n.nb_input_values_total()).unwrap_or(0);
        let policy_size = nets.first().map(|n| n.policy_size()).unwrap_or(0);
        let visits_pre_search = root_node.visits();

        Self {
            staging: BatchStaging::new(settings.batch_size, plane_values),
            value_outputs: vec![0.0; settings.batch_size],
            prob_outputs: vec![0.0; settings.batch_size * policy_size],
            trajectory_buffer: Vec::with_capacity(DEPTH_INIT),
            actions_buffer: Vec::with_capacity(DEPTH_INIT),
            phase_to_net: HashMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            rng: ChaCha20Rng::seed_from_u64(seed),
            root_node,
            root_state,
            map,
            nets,
            settings,
            limits,
            tb_hits: 0,
            depth_sum: 0,
            depth_max: 0,
            visits_pre_search,
        }
    }

    /// Route game phases to network indices for phase-specialist setups.
    pub fn with_phase_to_net(mut self, phase_to_net: HashMap<GamePhase, usize>) -> Self {
        self.phase_to_net = phase_to_net;
        self
    }

    pub fn set_search_limits(&mut self, limits: SearchLimits) {
        self.limits = limits;
    }

    /// Flag that stops the driver loop at the next iteration boundary.
    /// Cancellation is cooperative: the running iteration completes so its
    /// virtual losses are reverted.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn root_node(&self) -> &Arc<Node> {
        &self.root_node
    }

    pub fn map(&self) -> &Arc<TranspositionMap> {
        &self.map
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn tb_hits(&self) -> u64 {
        self.tb_hits
    }

    pub fn max_depth(&self) -> usize {
        self.depth_max
    }

    pub fn visits_pre_search(&self) -> u32 {
        self.visits_pre_search
    }

    /// Mean selection depth over this search's completed iterations.
    pub fn avg_depth(&self) -> usize {
        let visits = self.root_node.visits().saturating_sub(self.visits_pre_search);
        if visits == 0 {
            0
        } else {
            (self.depth_sum as f64 / visits as f64 + 0.5) as usize
        }
    }

    pub fn reset_stats(&mut self) {
        self.tb_hits = 0;
        self.depth_sum = 0;
        self.depth_max = 0;
    }

    /// Driver loop: iterate until stopped, a limit trips or the root is
    /// solved.
    pub fn run(&mut self) {
        self.running.store(true, Ordering::SeqCst);
        self.reset_stats();
        debug!(root_visits = self.root_node.visits(), "search worker started");
        while self.is_running() && self.nodes_limits_ok() && self.is_root_node_unsolved() {
            self.thread_iteration();
        }
        self.running.store(false, Ordering::SeqCst);
        debug!(
            root_visits = self.root_node.visits(),
            depth_max = self.depth_max,
            tb_hits = self.tb_hits,
            "search worker stopped"
        );
    }

    /// One full iteration: assemble a mini-batch, evaluate it, back up.
    pub fn thread_iteration(&mut self) {
        self.create_mini_batch();
        self.dispatch_and_backup();
    }

    /// All node-count limits pass; a limit of 0 is disabled.
    pub fn nodes_limits_ok(&self) -> bool {
        let node_count = self.map.node_count() as u64;
        let root_visits = self.root_node.visits() as u64;
        (self.limits.nodes == 0 || node_count < self.limits.nodes)
            && (self.limits.simulations == 0 || root_visits < self.limits.simulations)
            && (self.limits.nodes_limit == 0 || node_count < self.limits.nodes_limit)
    }

    pub fn is_root_node_unsolved(&self) -> bool {
        is_unsolved_or_tablebase(self.root_node.node_type())
    }

    /// Select leaves until one of the four staging capacities trips:
    /// the new-leaf batch, the collision list, the transposition list or
    /// the terminal allowance.
    pub(crate) fn create_mini_batch(&mut self) {
        let terminal_node_cache = self.settings.terminal_node_cache();
        let mut num_terminal_nodes = 0usize;

        while !self.staging.new_nodes.is_full()
            && self.staging.collision_trajectories.len() != self.settings.batch_size
            && !self.staging.transposition_values.is_full()
            && num_terminal_nodes < terminal_node_cache
        {
            self.trajectory_buffer.clear();
            self.actions_buffer.clear();
            let (leaf, description) = self.get_new_child_to_evaluate();
            self.depth_sum += description.depth as u64;
            self.depth_max = self.depth_max.max(description.depth);

            match description.kind {
                NodeBackup::Terminal => {
                    // Back up right away so the worker does not sit on
                    // applied virtual loss while the batch fills.
                    num_terminal_nodes += 1;
                    backup_value(
                        Some(&leaf),
                        leaf.value(),
                        &self.settings,
                        &self.trajectory_buffer,
                        self.settings.mcts_solver,
                    );
                }
                NodeBackup::Collision => {
                    self.staging
                        .collision_trajectories
                        .push(self.trajectory_buffer.clone());
                }
                NodeBackup::Transposition => {
                    self.staging
                        .transposition_trajectories
                        .push(self.trajectory_buffer.clone());
                }
                NodeBackup::NewNode => {
                    self.staging.new_nodes.add_element(leaf);
                    self.staging
                        .new_trajectories
                        .push(self.trajectory_buffer.clone());
                }
            }
        }
    }

    /// Evaluate the staged batch (in neural mode) and consume every
    /// recorded trajectory: new leaves first, then transposition borrows,
    /// then collisions.
    pub(crate) fn dispatch_and_backup(&mut self) {
        if self.settings.search_mode == SearchMode::Neural && !self.staging.new_nodes.is_empty() {
            let net_idx = self.select_nn_index();
            let net = Arc::clone(&self.nets[net_idx]);
            let batch = self.staging.new_nodes.len();
            let plane_values = net.nb_input_values_total();
            let policy_size = net.policy_size();
            debug!(batch, net_idx, "dispatching mini-batch");
            net.predict(
                &self.staging.input_planes[..batch * plane_values],
                &mut self.value_outputs[..batch],
                &mut self.prob_outputs[..batch * policy_size],
            );
            self.set_nn_results_to_child_nodes();
        }
        self.backup_value_outputs();
        self.backup_collisions();
    }

    /// Walk from the root to one leaf, applying virtual loss and recording
    /// the trajectory. Returns the leaf and what kind of backup it needs.
    pub(crate) fn get_new_child_to_evaluate(&mut self) -> (Arc<Node>, NodeDescription) {
        let mut depth = 0usize;
        let mut current = Arc::clone(&self.root_node);
        let mut child_idx: Option<ChildIdx> = None;

        if self.settings.epsilon_greedy_counter != 0
            && self.root_node.is_playout_node()
            && self.rng.gen_range(0..self.settings.epsilon_greedy_counter) == 0
        {
            current = self.get_starting_node(current, &mut depth);
            let mut inner = current.lock();
            child_idx = current.random_playout(&mut inner, &mut self.rng);
        } else if self.settings.epsilon_checks_counter != 0
            && self.root_node.is_playout_node()
            && self.rng.gen_range(0..self.settings.epsilon_checks_counter) == 0
        {
            current = self.get_starting_node(current, &mut depth);
            let mut inner = current.lock();
            child_idx = self.select_enhanced_move(&current, &mut inner);
            if child_idx.is_none() {
                child_idx = current.random_playout(&mut inner, &mut self.rng);
            }
        }

        loop {
            let mut inner = current.lock();
            let idx = match child_idx.take() {
                Some(idx) => idx,
                None => current.select_child_node(&inner, &self.settings),
            };
            current.apply_virtual_loss_to_child(&mut inner, idx, &self.settings);
            self.trajectory_buffer.push((Arc::clone(&current), idx));
            depth += 1;

            let next = inner.child(idx);
            let Some(next) = next else {
                // Empty slot: reconstruct the child state and expand.
                let mut new_state = self.root_state.clone_dyn();
                debug_assert_eq!(self.actions_buffer.len(), depth - 1);
                for &action in &self.actions_buffer {
                    new_state.do_action(action);
                }
                new_state.do_action(inner.action(idx));
                current.increment_no_visit_idx(&mut inner);
                let (leaf, is_transposition) = current.add_new_node_to_tree(
                    &mut inner,
                    &self.map,
                    new_state.as_ref(),
                    idx,
                    &self.settings,
                );
                drop(inner);

                let kind = if leaf.is_terminal() {
                    NodeBackup::Terminal
                } else if is_transposition {
                    self.staging.transposition_values.add_element(leaf.value());
                    NodeBackup::Transposition
                } else {
                    match self.settings.search_mode {
                        SearchMode::Rollout => {
                            let value = new_state.random_rollout(&mut self.rng);
                            leaf.set_value(value);
                            leaf.enable_has_nn_results();
                        }
                        SearchMode::Neural => {
                            new_state.write_state_planes(true, self.staging.next_input_slot());
                            let phase = new_state.phase(
                                self.settings.num_phases,
                                self.settings.game_phase_definition,
                            );
                            self.staging.count_phase(phase);
                            self.staging
                                .new_node_side_to_move
                                .add_element(new_state.side_to_move());
                        }
                    }
                    NodeBackup::NewNode
                };
                trace!(depth, ?kind, "expanded leaf");
                return (leaf, NodeDescription { depth, kind });
            };

            if next.is_terminal() {
                return (
                    next,
                    NodeDescription {
                        depth,
                        kind: NodeBackup::Terminal,
                    },
                );
            }
            if !next.has_nn_results() {
                trace!(depth, "collision with in-flight evaluation");
                return (
                    next,
                    NodeDescription {
                        depth,
                        kind: NodeBackup::Collision,
                    },
                );
            }
            if next.is_transposition() {
                let real_visits = current.get_real_visits(&inner, idx);
                if real_visits > 0 {
                    let transpos_q = current.get_transposition_q_value(&inner, idx, real_visits);
                    if next.is_transposition_return(transpos_q) {
                        let backup =
                            get_transposition_backup_value(real_visits, transpos_q, next.value());
                        self.staging.transposition_values.add_element(backup);
                        return (
                            next,
                            NodeDescription {
                                depth,
                                kind: NodeBackup::Transposition,
                            },
                        );
                    }
                }
            }

            let action = inner.action(idx);
            drop(inner);
            self.actions_buffer.push(action);
            current = next;
            child_idx = None;
        }
    }

    /// Descend a random number of levels along the strongest line before an
    /// exploration probe, skipping nodes too fresh to judge.
    fn get_starting_node(&mut self, start: Arc<Node>, depth: &mut usize) -> Arc<Node> {
        let mut current = start;
        let target_depth = random_depth(&mut self.rng);
        for _ in 0..target_depth {
            let inner = current.lock();
            let idx = current.select_child_node(&inner, &self.settings);
            let Some(next) = inner.child(idx) else {
                break;
            };
            if !next.is_playout_node()
                || next.visits() < self.settings.epsilon_greedy_counter
                || next.node_type() != NodeType::Unsolved
            {
                break;
            }
            let action = inner.action(idx);
            drop(inner);
            self.actions_buffer.push(action);
            current = next;
            *depth += 1;
        }
        current
    }

    /// Check probe: replay the position and dispatch the first unexplored
    /// checking move, advancing `no_visit_idx` past it. A node that yields
    /// no check is marked inspected and never scanned again.
    fn select_enhanced_move(&self, node: &Node, inner: &mut NodeInner) -> Option<ChildIdx> {
        if !node.is_playout_node() || inner.was_inspected || node.is_terminal() {
            return None;
        }

        let mut pos = self.root_state.clone_dyn();
        for &action in &self.actions_buffer {
            pos.do_action(action);
        }

        for idx in inner.no_visit_idx..inner.num_children() {
            if pos.gives_check(inner.action(idx)) {
                while inner.no_visit_idx < idx + 1 {
                    node.increment_no_visit_idx(inner);
                }
                return Some(idx);
            }
        }
        inner.was_inspected = true;
        None
    }

    /// Network for the current batch: with several networks, the one
    /// serving the most common game phase among the staged leaves.
    fn select_nn_index(&mut self) -> usize {
        let majority = self.staging.take_majority_phase();
        if self.nets.len() == 1 {
            return 0;
        }
        match majority {
            Some(phase) => self.phase_to_net.get(&phase).copied().unwrap_or(0),
            None => 0,
        }
    }

    /// Distribute the batch outputs to the staged leaves and publish them.
    fn set_nn_results_to_child_nodes(&mut self) {
        let net = &self.nets[0];
        debug_assert!(net.is_policy_map());
        let policy_size = net.policy_size();
        let root_is_tablebase = self.root_node.is_tablebase();

        for (batch_idx, node) in self.staging.new_nodes.iter().enumerate() {
            let side = *self.staging.new_node_side_to_move.get(batch_idx);
            let mirror = self.root_state.mirror_policy(side);
            fill_nn_results(
                batch_idx,
                policy_size,
                &self.value_outputs,
                &self.prob_outputs,
                node,
                &mut self.tb_hits,
                mirror,
                &self.settings,
                root_is_tablebase,
            );
        }
    }

    /// Back up evaluated leaves, then transposition borrows.
    fn backup_value_outputs(&mut self) {
        for (idx, node) in self.staging.new_nodes.iter().enumerate() {
            let solve_for_terminal = self.settings.mcts_solver && node.is_tablebase();
            backup_value(
                Some(node),
                node.value(),
                &self.settings,
                &self.staging.new_trajectories[idx],
                solve_for_terminal,
            );
        }
        self.staging.new_nodes.clear();
        self.staging.new_node_side_to_move.clear();
        self.staging.new_trajectories.clear();

        for (idx, value) in self.staging.transposition_values.iter().enumerate() {
            backup_value(
                None,
                *value,
                &self.settings,
                &self.staging.transposition_trajectories[idx],
                false,
            );
        }
        self.staging.transposition_values.clear();
        self.staging.transposition_trajectories.clear();
    }

    fn backup_collisions(&mut self) {
        for trajectory in &self.staging.collision_trajectories {
            backup_collision(&self.settings, trajectory);
        }
        self.staging.collision_trajectories.clear();
    }
}

/// Write one staged leaf's outputs into the node and publish it.
#[allow(clippy::too_many_arguments)]
fn fill_nn_results(
    batch_idx: usize,
    policy_size: usize,
    value_outputs: &[f32],
    prob_outputs: &[f32],
    node: &Arc<Node>,
    tb_hits: &mut u64,
    mirror: bool,
    settings: &SearchSettings,
    root_is_tablebase: bool,
) {
    let policy = &prob_outputs[batch_idx * policy_size..(batch_idx + 1) * policy_size];
    {
        let mut inner = node.lock();
        node.set_probabilities_for_moves(&mut inner, policy, mirror);
        node.enhance_moves(&mut inner, settings);
        node.apply_temperature_to_prior_policy(&mut inner, settings.node_policy_temperature);
    }
    node_assign_value(node, value_outputs[batch_idx], tb_hits, root_is_tablebase);
    node.enable_has_nn_results();
}

/// Assign the value head output. Tablebase nodes keep their exact value,
/// except that non-draw entries are averaged with the network's estimate
/// while the root itself is in the tablebase.
pub(crate) fn node_assign_value(
    node: &Node,
    value_output: f32,
    tb_hits: &mut u64,
    root_is_tablebase: bool,
) {
    if node.is_tablebase() {
        *tb_hits += 1;
        if node.value() != 0.0 && root_is_tablebase {
            node.set_value((value_output + node.value()) * 0.5);
        }
        return;
    }
    node.set_value(value_output);
}

/// Depth of an exploration probe: 100 discrete buckets of a geometric-like
/// distribution. The top bucket saturates and descends until a break
/// condition fires.
fn random_depth(rng: &mut ChaCha20Rng) -> usize {
    let rand_int = rng.gen_range(1..=100u32);
    let raw = (-(1.0 - rand_int as f64 / 100.0).log2() - 1.0).ceil();
    if raw.is_finite() {
        raw.max(0.0) as usize
    } else {
        usize::MAX
    }
}

/// Evaluate a root position in place so workers can start selecting below
/// it. The root controller normally does this once before spawning workers.
pub fn evaluate_root(
    root: &Arc<Node>,
    state: &dyn GameState,
    net: &dyn NeuralNetApi,
    settings: &SearchSettings,
) {
    if root.has_nn_results() || root.is_terminal() {
        return;
    }
    let mut input = vec![0.0f32; net.nb_input_values_total()];
    state.write_state_planes(true, &mut input);
    let mut value = [0.0f32];
    let mut probs = vec![0.0f32; net.policy_size()];
    net.predict(&input, &mut value, &mut probs);

    {
        let mut inner = root.lock();
        root.set_probabilities_for_moves(&mut inner, &probs, state.mirror_policy(state.side_to_move()));
        root.enhance_moves(&mut inner, settings);
        root.apply_temperature_to_prior_policy(&mut inner, settings.node_policy_temperature);
    }
    root.set_value(value[0]);
    root.enable_has_nn_results();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::UniformNet;
    use crate::testutil::{CountingNet, MockState};
    use games_tictactoe::{TicTacToe, NUM_ACTIONS, PLANE_VALUES};
    use spindle_core::Action;
    use std::collections::HashSet;

    fn make_worker<S: GameState + Clone + 'static>(
        state: S,
        net: Arc<dyn NeuralNetApi>,
        settings: SearchSettings,
        limits: SearchLimits,
        seed: u64,
    ) -> SearchWorker {
        let root = Arc::new(Node::from_state(&state, &settings));
        let map = Arc::new(TranspositionMap::new());
        map.register_root(&root);
        evaluate_root(&root, &state, net.as_ref(), &settings);
        SearchWorker::new(
            root,
            Box::new(state),
            map,
            vec![net],
            settings,
            limits,
            seed,
        )
    }

    /// Worker sharing an existing root and map.
    fn make_sibling_worker<S: GameState + Clone + 'static>(
        state: S,
        root: Arc<Node>,
        map: Arc<TranspositionMap>,
        net: Arc<dyn NeuralNetApi>,
        settings: SearchSettings,
        limits: SearchLimits,
        seed: u64,
    ) -> SearchWorker {
        SearchWorker::new(
            root,
            Box::new(state),
            map,
            vec![net],
            settings,
            limits,
            seed,
        )
    }

    fn assert_virtual_losses_zero(root: &Arc<Node>) {
        let mut seen = HashSet::new();
        let mut stack = vec![Arc::clone(root)];
        while let Some(node) = stack.pop() {
            if !seen.insert(Arc::as_ptr(&node) as usize) {
                continue;
            }
            let inner = node.lock();
            for idx in 0..inner.num_children() {
                assert_eq!(
                    inner.child_virtual_loss[idx], 0,
                    "pending virtual loss on an edge after all backups"
                );
                if let Some(child) = inner.child(idx) {
                    stack.push(child);
                }
            }
        }
    }

    /// Position where the side to move has exactly one legal move and that
    /// move wins on the spot.
    fn forced_win_position() -> TicTacToe {
        // X holds 1, 2, 3, 4 and O holds 0, 5, 6, 8; cell 7 completes the
        // 1-4-7 file for X.
        TicTacToe::from_moves(&[1, 0, 2, 5, 3, 6, 4, 8])
    }

    #[test]
    fn terminal_shortcut_backs_up_without_nn_calls() {
        let settings = SearchSettings::for_testing();
        let net = Arc::new(CountingNet::new(PLANE_VALUES, NUM_ACTIONS));
        let mut worker = make_worker(
            forced_win_position(),
            net.clone() as Arc<dyn NeuralNetApi>,
            settings.clone(),
            SearchLimits::default(),
            11,
        );
        assert_eq!(worker.root_node().number_of_children(), 1);
        let calls_before = net.calls();

        worker.thread_iteration();

        // Every selection found the terminal child; nothing was staged and
        // the network was never queried.
        assert_eq!(net.calls(), calls_before);
        assert_eq!(
            worker.root_node().visits() as usize,
            settings.terminal_node_cache()
        );
        assert_eq!(worker.tb_hits(), 0);
        // Only the root and the one terminal child exist.
        assert_eq!(worker.map().node_count(), 2);
        // The solver saw the lost child and solved the root as a win.
        assert_eq!(worker.root_node().node_type(), NodeType::SolvedWin);
        assert_virtual_losses_zero(worker.root_node());
    }

    #[test]
    fn collision_stores_the_trajectory_and_grows_the_tree_once() {
        // Position with exactly two open cells so both workers contest the
        // same top edge.
        let state = TicTacToe::from_moves(&[0, 4, 8, 1, 7, 6, 2]);
        let settings = SearchSettings::for_testing().with_batch_size(1);
        let net: Arc<dyn NeuralNetApi> = Arc::new(UniformNet::new(PLANE_VALUES, NUM_ACTIONS));

        let mut first = make_worker(
            state,
            Arc::clone(&net),
            settings.clone(),
            SearchLimits::default(),
            1,
        );
        let mut second = make_sibling_worker(
            state,
            Arc::clone(first.root_node()),
            Arc::clone(first.map()),
            net,
            settings,
            SearchLimits::default(),
            2,
        );

        first.create_mini_batch();
        assert_eq!(first.staging.new_nodes.len(), 1);
        let pending = first.staging.new_nodes.get(0).clone();
        assert!(!pending.has_nn_results());

        second.create_mini_batch();
        assert_eq!(second.staging.collision_trajectories.len(), 1);
        assert!(second.staging.new_nodes.is_empty());

        second.dispatch_and_backup();
        first.dispatch_and_backup();

        assert!(pending.has_nn_results());
        // Root plus exactly one child: the collision did not duplicate it.
        assert_eq!(first.map().node_count(), 2);
        assert_eq!(first.root_node().visits(), 1);
        assert_virtual_losses_zero(first.root_node());
    }

    #[test]
    fn transpositions_are_found_during_search() {
        let settings = SearchSettings::for_testing().with_batch_size(4);
        let net: Arc<dyn NeuralNetApi> = Arc::new(UniformNet::new(PLANE_VALUES, NUM_ACTIONS));
        let mut worker = make_worker(
            TicTacToe::new(),
            net,
            settings,
            SearchLimits::default().with_simulations(600),
            5,
        );
        worker.run();

        // Permuted openings reconverge, so the map must have seen hits.
        let (hits, _misses) = worker.map().stats();
        assert!(hits > 0, "expected transposition hits in a 600-visit search");
        assert_virtual_losses_zero(worker.root_node());
    }

    #[test]
    fn epsilon_greedy_spreads_visits_over_the_root_children() {
        let settings = SearchSettings::for_testing()
            .with_batch_size(4)
            .with_epsilon_greedy(1);
        let net: Arc<dyn NeuralNetApi> = Arc::new(UniformNet::new(PLANE_VALUES, NUM_ACTIONS));
        let mut worker = make_worker(
            TicTacToe::new(),
            net,
            settings,
            SearchLimits::default(),
            9,
        );

        for _ in 0..30 {
            worker.thread_iteration();
        }

        let inner = worker.root_node().lock();
        let visited = (0..inner.num_children())
            .filter(|&idx| inner.child_visits[idx] > 0)
            .count();
        assert!(
            visited >= 2,
            "random playouts must reach children outside the top pick, saw {visited}"
        );
    }

    #[test]
    fn check_probe_dispatches_the_checking_move_once() {
        let settings = SearchSettings::for_testing().with_epsilon_checks(1);
        let net: Arc<dyn NeuralNetApi> =
            Arc::new(UniformNet::new(MockState::PLANE_VALUES, MockState::POLICY_SIZE));
        let state = MockState::new(4, 3).with_checks(&[2]);
        let worker = make_worker(state, net, settings, SearchLimits::default(), 3);
        let root = Arc::clone(worker.root_node());

        let mut inner = root.lock();
        let first = worker.select_enhanced_move(&root, &mut inner);
        // Uniform priors keep the stable action order 0..4, so the checking
        // action 2 sits at slot 2.
        assert_eq!(first, Some(2));
        assert_eq!(inner.action(2), 2);
        assert_eq!(inner.no_visit_idx, 3);
        assert!(!inner.was_inspected);

        // No checking move remains: the probe marks the node inspected.
        let second = worker.select_enhanced_move(&root, &mut inner);
        assert_eq!(second, None);
        assert!(inner.was_inspected);

        // Inspected nodes return the sentinel immediately.
        let third = worker.select_enhanced_move(&root, &mut inner);
        assert_eq!(third, None);
    }

    #[test]
    fn simulations_limit_stops_the_driver() {
        let settings = SearchSettings::for_testing();
        let net = Arc::new(CountingNet::new(PLANE_VALUES, NUM_ACTIONS));
        let mut worker = make_worker(
            TicTacToe::new(),
            net.clone() as Arc<dyn NeuralNetApi>,
            settings.clone(),
            SearchLimits::default().with_simulations(50),
            13,
        );

        worker.run();

        assert!(!worker.is_running());
        let visits = worker.root_node().visits();
        assert!(visits >= 50, "driver stopped early at {visits} visits");
        // Overshoot is bounded by one iteration's worth of backups.
        assert!((visits as usize) < 50 + 4 * settings.terminal_node_cache());
        assert!(worker.avg_depth() >= 1);
        assert!(worker.max_depth() >= 1);
        assert_virtual_losses_zero(worker.root_node());
    }

    #[test]
    fn batch_size_one_performs_at_most_one_nn_call_per_iteration() {
        let settings = SearchSettings::for_testing().with_batch_size(1);
        let net = Arc::new(CountingNet::new(PLANE_VALUES, NUM_ACTIONS));
        let mut worker = make_worker(
            TicTacToe::new(),
            net.clone() as Arc<dyn NeuralNetApi>,
            settings,
            SearchLimits::default(),
            17,
        );
        let baseline = net.calls();

        for _ in 0..10 {
            let before = net.calls();
            worker.thread_iteration();
            assert!(net.calls() - before <= 1);
        }
        assert!(net.calls() > baseline);
    }

    #[test]
    fn limits_of_zero_never_trip() {
        let settings = SearchSettings::for_testing();
        let net: Arc<dyn NeuralNetApi> = Arc::new(UniformNet::new(PLANE_VALUES, NUM_ACTIONS));
        let mut worker = make_worker(
            TicTacToe::new(),
            net,
            settings,
            SearchLimits::default(),
            19,
        );
        for _ in 0..5 {
            worker.thread_iteration();
        }
        assert!(worker.nodes_limits_ok());
    }

    #[test]
    fn seeded_single_worker_searches_are_reproducible() {
        let run = |seed: u64| {
            let settings = SearchSettings::for_testing().with_batch_size(4);
            let net: Arc<dyn NeuralNetApi> = Arc::new(UniformNet::new(PLANE_VALUES, NUM_ACTIONS));
            let mut worker = make_worker(
                TicTacToe::new(),
                net,
                settings,
                SearchLimits::default().with_simulations(80),
                seed,
            );
            worker.run();
            let inner = worker.root_node().lock();
            let stats: Vec<(Action, u32)> = (0..inner.num_children())
                .map(|idx| (inner.action(idx), inner.child_visits[idx]))
                .collect();
            (stats, worker.map().node_count())
        };

        assert_eq!(run(7), run(7));
    }

    #[test]
    fn rollout_mode_searches_without_networks() {
        let settings = SearchSettings::for_testing()
            .with_search_mode(SearchMode::Rollout)
            .with_batch_size(4);
        let state = TicTacToe::new();
        let root = Arc::new(Node::from_state(&state, &settings));
        let map = Arc::new(TranspositionMap::new());
        map.register_root(&root);
        // Rollout mode needs no pre-evaluation: publish uniform priors by
        // valuing the root itself with a rollout of zero information.
        {
            let mut inner = root.lock();
            let uniform = vec![1.0 / NUM_ACTIONS as f32; NUM_ACTIONS];
            root.set_probabilities_for_moves(&mut inner, &uniform, false);
        }
        root.enable_has_nn_results();

        let mut worker = SearchWorker::new(
            root,
            Box::new(state),
            map,
            Vec::new(),
            settings,
            SearchLimits::default().with_simulations(60),
            23,
        );
        worker.run();

        assert!(worker.root_node().visits() >= 60);
        assert_virtual_losses_zero(worker.root_node());
    }

    #[test]
    fn parallel_workers_keep_the_tree_consistent() {
        let settings = SearchSettings::for_testing().with_batch_size(4);
        let net: Arc<dyn NeuralNetApi> = Arc::new(UniformNet::new(PLANE_VALUES, NUM_ACTIONS));
        let state = TicTacToe::new();
        let root = Arc::new(Node::from_state(&state, &settings));
        let map = Arc::new(TranspositionMap::new());
        map.register_root(&root);
        evaluate_root(&root, &state, net.as_ref(), &settings);
        let limits = SearchLimits::default().with_simulations(300);

        std::thread::scope(|scope| {
            for seed in 0..3u64 {
                let root = Arc::clone(&root);
                let map = Arc::clone(&map);
                let net = Arc::clone(&net);
                let settings = settings.clone();
                scope.spawn(move || {
                    let mut worker = make_sibling_worker(
                        state, root, map, net, settings, limits, seed,
                    );
                    worker.run();
                });
            }
        });

        assert!(root.visits() >= 300);
        assert_virtual_losses_zero(&root);
    }

    #[test]
    fn tablebase_values_average_with_the_network_under_a_tablebase_root() {
        let settings = SearchSettings::for_testing();
        let node = Arc::new(Node::from_state(&TicTacToe::new(), &settings));
        node.set_tablebase(1.0);

        let mut tb_hits = 0u64;
        node_assign_value(&node, 0.5, &mut tb_hits, true);
        assert_eq!(tb_hits, 1);
        assert!((node.value() - 0.75).abs() < 1e-6);

        // Without a tablebase root the exact value is kept.
        let node = Arc::new(Node::from_state(&TicTacToe::new(), &settings));
        node.set_tablebase(1.0);
        node_assign_value(&node, 0.5, &mut tb_hits, false);
        assert_eq!(tb_hits, 2);
        assert!((node.value() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn evaluate_root_publishes_priors_and_value() {
        let settings = SearchSettings::for_testing();
        let net = UniformNet::new(PLANE_VALUES, NUM_ACTIONS);
        let state = TicTacToe::new();
        let root = Arc::new(Node::from_state(&state, &settings));
        assert!(!root.has_nn_results());

        evaluate_root(&root, &state, &net, &settings);

        assert!(root.has_nn_results());
        let inner = root.lock();
        let sum: f32 = inner.priors.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);

        // Re-evaluating is a no-op.
        drop(inner);
        evaluate_root(&root, &state, &net, &settings);
    }

    #[test]
    fn random_depth_follows_the_bucketed_distribution() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let mut max_seen = 0usize;
        for _ in 0..1000 {
            let depth = random_depth(&mut rng);
            if depth != usize::MAX {
                max_seen = max_seen.max(depth);
            }
        }
        // Half the draws land in the zero bucket; deep draws stay rare.
        assert!(max_seen >= 1);
        assert!(max_seen <= 7);
    }
}
