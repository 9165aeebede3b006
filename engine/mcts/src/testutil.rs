//! Shared fixtures for the crate's unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::RngCore;
use spindle_core::{
    clamp_phase, Action, GamePhase, GamePhaseDefinition, GameState, SideToMove, TerminalKind,
};

use crate::evaluator::{NeuralNetApi, UniformNet};

/// Scriptable line game: every non-terminal position offers the same
/// actions, play ends at a fixed depth and the path taken is the identity
/// of a position. Checks and terminal outcomes are configurable.
#[derive(Debug, Clone)]
pub struct MockState {
    num_actions: u16,
    max_depth: usize,
    depth: usize,
    path: Vec<Action>,
    checks: Vec<Action>,
    side: SideToMove,
    terminal_kind: TerminalKind,
    rollout_value: f32,
}

impl MockState {
    pub const POLICY_SIZE: usize = 8;
    pub const PLANE_VALUES: usize = 4;

    pub fn new(num_actions: u16, max_depth: usize) -> Self {
        assert!(num_actions as usize <= Self::POLICY_SIZE);
        Self {
            num_actions,
            max_depth,
            depth: 0,
            path: Vec::new(),
            checks: Vec::new(),
            side: SideToMove::First,
            terminal_kind: TerminalKind::Loss,
            rollout_value: 0.0,
        }
    }

    /// Actions that give check at every position.
    pub fn with_checks(mut self, checks: &[Action]) -> Self {
        self.checks = checks.to_vec();
        self
    }

    /// Terminal outcome reported at `max_depth`.
    pub fn with_terminal_kind(mut self, kind: TerminalKind) -> Self {
        self.terminal_kind = kind;
        self
    }

    pub fn with_rollout_value(mut self, value: f32) -> Self {
        self.rollout_value = value;
        self
    }
}

impl GameState for MockState {
    fn clone_dyn(&self) -> Box<dyn GameState> {
        Box::new(self.clone())
    }

    fn do_action(&mut self, action: Action) {
        self.path.push(action);
        self.depth += 1;
        self.side = self.side.flipped();
    }

    fn legal_actions(&self) -> Vec<Action> {
        if self.depth >= self.max_depth {
            return Vec::new();
        }
        (0..self.num_actions).collect()
    }

    fn side_to_move(&self) -> SideToMove {
        self.side
    }

    fn hash_key(&self) -> u64 {
        // Order-sensitive FNV over the path: no accidental transpositions.
        self.path
            .iter()
            .fold(0xcbf2_9ce4_8422_2325u64, |hash, &action| {
                (hash ^ (action as u64 + 1)).wrapping_mul(0x0000_0100_0000_01b3)
            })
    }

    fn gives_check(&self, action: Action) -> bool {
        self.checks.contains(&action)
    }

    fn terminal(&self) -> TerminalKind {
        if self.depth >= self.max_depth {
            self.terminal_kind
        } else {
            TerminalKind::None
        }
    }

    fn mirror_policy(&self, _side: SideToMove) -> bool {
        false
    }

    fn plane_values(&self) -> usize {
        Self::PLANE_VALUES
    }

    fn write_state_planes(&self, _normalize: bool, out: &mut [f32]) {
        out.fill(0.0);
        out[0] = self.depth as f32;
        if let Some(&last) = self.path.last() {
            out[1] = last as f32;
        }
    }

    fn phase(&self, num_phases: usize, _definition: GamePhaseDefinition) -> GamePhase {
        clamp_phase(self.depth, num_phases)
    }

    fn random_rollout(&mut self, _rng: &mut dyn RngCore) -> f32 {
        self.rollout_value
    }
}

/// Uniform evaluator that counts forward passes.
pub struct CountingNet {
    inner: UniformNet,
    calls: AtomicUsize,
}

impl CountingNet {
    pub fn new(plane_values: usize, policy_len: usize) -> Self {
        Self {
            inner: UniformNet::new(plane_values, policy_len),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NeuralNetApi for CountingNet {
    fn predict(&self, input_planes: &[f32], value_outputs: &mut [f32], prob_outputs: &mut [f32]) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.predict(input_planes, value_outputs, prob_outputs);
    }

    fn is_policy_map(&self) -> bool {
        self.inner.is_policy_map()
    }

    fn nb_input_values_total(&self) -> usize {
        self.inner.nb_input_values_total()
    }

    fn policy_size(&self) -> usize {
        self.inner.policy_size()
    }

    fn version(&self) -> u32 {
        self.inner.version()
    }
}
