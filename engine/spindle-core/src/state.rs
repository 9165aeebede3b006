//! Game-state abstraction consumed by the search engine.
//!
//! The search never inspects a concrete board representation. It clones the
//! root state, replays recorded actions and queries the resulting position
//! through this trait, so any turn-based game can plug into the worker loop.

use rand::RngCore;

use crate::phase::{GamePhase, GamePhaseDefinition};

/// Action identifier within a game's global action space.
///
/// Policy heads are indexed by this value, so it must be stable across all
/// positions of a game.
pub type Action = u16;

/// Side to move in a two-player game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideToMove {
    First,
    Second,
}

impl SideToMove {
    /// The opponent of this side.
    #[inline]
    pub fn flipped(self) -> Self {
        match self {
            SideToMove::First => SideToMove::Second,
            SideToMove::Second => SideToMove::First,
        }
    }
}

/// Terminal classification of a position, always from the perspective of the
/// side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// Game still in progress.
    None,
    /// The side to move has won.
    Win,
    /// The side to move has lost (e.g. it is checkmated).
    Loss,
    /// The game ended in a draw.
    Draw,
}

impl TerminalKind {
    #[inline]
    pub fn is_terminal(self) -> bool {
        !matches!(self, TerminalKind::None)
    }

    /// Game-theoretic score for the side to move.
    #[inline]
    pub fn value(self) -> f32 {
        match self {
            TerminalKind::Win => 1.0,
            TerminalKind::Loss => -1.0,
            TerminalKind::None | TerminalKind::Draw => 0.0,
        }
    }
}

/// A playable game position.
///
/// Implementations must be cheap to clone and deterministic: the search
/// reconstructs positions by cloning a root and replaying actions, and two
/// states with equal `hash_key` are treated as the same position.
pub trait GameState: Send {
    /// Clone this position behind a fresh box.
    fn clone_dyn(&self) -> Box<dyn GameState>;

    /// Apply a legal action in place.
    fn do_action(&mut self, action: Action);

    /// Legal actions of this position. The returned order is the initial
    /// child order of a freshly expanded node.
    fn legal_actions(&self) -> Vec<Action>;

    fn side_to_move(&self) -> SideToMove;

    /// Position hash. Equal hashes must mean equal positions.
    fn hash_key(&self) -> u64;

    /// Whether playing `action` gives check (or the game's equivalent of a
    /// forcing threat). Games without such a concept return `false`.
    fn gives_check(&self, action: Action) -> bool;

    /// Terminal classification from the side-to-move perspective.
    fn terminal(&self) -> TerminalKind;

    /// Whether the policy head must be mirrored for positions where `side`
    /// is to move. Mirroring is index reversal over the action space.
    fn mirror_policy(&self, side: SideToMove) -> bool;

    /// Number of floats `write_state_planes` produces.
    fn plane_values(&self) -> usize;

    /// Write the network input planes for this position into `out`, which
    /// holds exactly `plane_values()` floats.
    fn write_state_planes(&self, normalize: bool, out: &mut [f32]);

    /// Game phase of this position under the given definition, in
    /// `0..num_phases`.
    fn phase(&self, num_phases: usize, definition: GamePhaseDefinition) -> GamePhase;

    /// Play uniformly random actions to the end of the game, mutating the
    /// position in place, and return the outcome from the perspective of
    /// the side to move at the starting position.
    fn random_rollout(&mut self, rng: &mut dyn RngCore) -> f32;
}

impl Clone for Box<dyn GameState> {
    fn clone(&self) -> Self {
        self.clone_dyn()
    }
}
