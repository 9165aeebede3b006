//! TicTacToe implementation of the Spindle [`GameState`] trait.
//!
//! This crate is the reference game used by the search's integration tests
//! and benches. It is deliberately small but exercises every part of the
//! state contract: terminal detection, a perfect position hash (which makes
//! transpositions from permuted move orders observable), plane encoding and
//! random rollouts.

use rand::RngCore;
use spindle_core::{
    clamp_phase, Action, GamePhase, GamePhaseDefinition, GameState, SideToMove, TerminalKind,
    TwoPlayerPlanes,
};

/// Number of board positions, which is also the size of the action space.
pub const NUM_ACTIONS: usize = 9;

/// Floats produced by `write_state_planes`.
pub const PLANE_VALUES: usize = TwoPlayerPlanes::<18, 9>::plane_values();

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8], // rows
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8], // columns
    [0, 4, 8],
    [2, 4, 6], // diagonals
];

/// TicTacToe position.
///
/// Cells hold 0 = empty, 1 = first player (X), 2 = second player (O). The
/// side to move always alternates, including onto terminal positions, so the
/// terminal classification is from the loser's perspective the way the
/// search expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicTacToe {
    board: [u8; 9],
    current_player: u8,
    winner: u8, // 0 = none, 1 = X, 2 = O, 3 = draw
    moves_played: u8,
}

impl TicTacToe {
    pub fn new() -> Self {
        Self {
            board: [0; 9],
            current_player: 1,
            winner: 0,
            moves_played: 0,
        }
    }

    /// Build a position from a sequence of moves starting at the empty board.
    pub fn from_moves(moves: &[Action]) -> Self {
        let mut state = Self::new();
        for &m in moves {
            state.make_move(m);
        }
        state
    }

    pub fn is_done(&self) -> bool {
        self.winner != 0
    }

    /// Bit-mask of currently legal moves. Zero once the game is finished.
    pub fn legal_moves_mask(&self) -> u64 {
        if self.is_done() {
            return 0;
        }
        self.board
            .iter()
            .enumerate()
            .fold(0u64, |mask, (idx, cell)| {
                if *cell == 0 {
                    mask | (1u64 << idx)
                } else {
                    mask
                }
            })
    }

    /// Play a move in place. Invalid moves are ignored.
    pub fn make_move(&mut self, position: Action) {
        let position = position as usize;
        if self.is_done() || position >= 9 || self.board[position] != 0 {
            return;
        }
        self.board[position] = self.current_player;
        self.moves_played += 1;
        self.winner = Self::check_winner(&self.board);
        self.current_player = if self.current_player == 1 { 2 } else { 1 };
    }

    fn check_winner(board: &[u8; 9]) -> u8 {
        for line in &LINES {
            let [a, b, c] = *line;
            if board[a] != 0 && board[a] == board[b] && board[b] == board[c] {
                return board[a];
            }
        }
        if board.iter().all(|&cell| cell != 0) {
            return 3;
        }
        0
    }

    fn side(player: u8) -> SideToMove {
        if player == 1 {
            SideToMove::First
        } else {
            SideToMove::Second
        }
    }
}

impl Default for TicTacToe {
    fn default() -> Self {
        Self::new()
    }
}

impl GameState for TicTacToe {
    fn clone_dyn(&self) -> Box<dyn GameState> {
        Box::new(*self)
    }

    fn do_action(&mut self, action: Action) {
        self.make_move(action);
    }

    fn legal_actions(&self) -> Vec<Action> {
        if self.is_done() {
            return Vec::new();
        }
        (0..NUM_ACTIONS as Action)
            .filter(|&pos| self.board[pos as usize] == 0)
            .collect()
    }

    fn side_to_move(&self) -> SideToMove {
        Self::side(self.current_player)
    }

    fn hash_key(&self) -> u64 {
        // The board uniquely determines the position (the side to move is
        // the parity of placed pieces), so a base-3 digit encoding is a
        // perfect hash.
        self.board
            .iter()
            .rev()
            .fold(0u64, |acc, &cell| acc * 3 + cell as u64)
    }

    fn gives_check(&self, _action: Action) -> bool {
        false
    }

    fn terminal(&self) -> TerminalKind {
        match self.winner {
            0 => TerminalKind::None,
            3 => TerminalKind::Draw,
            winner => {
                // The mover who completed a line already handed the turn
                // over, so the side to move is the losing side.
                if winner == self.current_player {
                    TerminalKind::Win
                } else {
                    TerminalKind::Loss
                }
            }
        }
    }

    fn mirror_policy(&self, _side: SideToMove) -> bool {
        // Both sides are encoded explicitly in the planes.
        false
    }

    fn plane_values(&self) -> usize {
        PLANE_VALUES
    }

    fn write_state_planes(&self, _normalize: bool, out: &mut [f32]) {
        TwoPlayerPlanes::<18, 9>::write(
            &self.board,
            self.legal_moves_mask(),
            self.side_to_move(),
            out,
        );
    }

    fn phase(&self, num_phases: usize, definition: GamePhaseDefinition) -> GamePhase {
        let raw = match definition {
            GamePhaseDefinition::MoveCount | GamePhaseDefinition::PieceCount => {
                self.moves_played as usize * num_phases / 10
            }
        };
        clamp_phase(raw, num_phases)
    }

    fn random_rollout(&mut self, rng: &mut dyn RngCore) -> f32 {
        let me = self.current_player;
        while !self.is_done() {
            let legal = self.legal_actions();
            let pick = (rng.next_u32() as usize) % legal.len();
            self.make_move(legal[pick]);
        }
        match self.winner {
            3 => 0.0,
            winner if winner == me => 1.0,
            _ => -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn fresh_board_has_nine_legal_moves() {
        let state = TicTacToe::new();
        assert_eq!(state.legal_actions().len(), 9);
        assert_eq!(state.legal_moves_mask(), 0b111111111);
        assert_eq!(state.side_to_move(), SideToMove::First);
        assert_eq!(state.terminal(), TerminalKind::None);
    }

    #[test]
    fn row_win_is_detected() {
        // X takes the top row while O plays along the bottom.
        let state = TicTacToe::from_moves(&[0, 6, 1, 7, 2]);
        assert!(state.is_done());
        // X completed the line, so the side to move (O) has lost.
        assert_eq!(state.side_to_move(), SideToMove::Second);
        assert_eq!(state.terminal(), TerminalKind::Loss);
        assert_eq!(state.legal_moves_mask(), 0);
        assert!(state.legal_actions().is_empty());
    }

    #[test]
    fn full_board_without_line_is_a_draw() {
        let state = TicTacToe::from_moves(&[0, 4, 8, 1, 7, 6, 2, 5, 3]);
        assert!(state.is_done());
        assert_eq!(state.terminal(), TerminalKind::Draw);
    }

    #[test]
    fn moves_after_the_end_are_ignored() {
        let mut state = TicTacToe::from_moves(&[0, 6, 1, 7, 2]);
        let before = state;
        state.make_move(5);
        assert_eq!(state, before);
    }

    #[test]
    fn permuted_move_orders_transpose() {
        let a = TicTacToe::from_moves(&[0, 4, 8]);
        let b = TicTacToe::from_moves(&[8, 4, 0]);
        assert_eq!(a.hash_key(), b.hash_key());

        let c = TicTacToe::from_moves(&[0, 4, 2]);
        assert_ne!(a.hash_key(), c.hash_key());
    }

    #[test]
    fn planes_round_out_at_29_values() {
        let state = TicTacToe::from_moves(&[0, 4]);
        let mut out = vec![0.0f32; PLANE_VALUES];
        state.write_state_planes(true, &mut out);
        assert_eq!(out[0], 1.0); // X on cell 0
        assert_eq!(out[9 + 4], 1.0); // O on cell 4
        assert_eq!(out[27], 1.0); // X to move
    }

    #[test]
    fn rollout_from_won_position_scores_the_winner() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        // O to move, X has already won.
        let mut state = TicTacToe::from_moves(&[0, 6, 1, 7, 2]);
        let value = state.random_rollout(&mut rng);
        assert!((value + 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn rollout_values_stay_in_range() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        for _ in 0..50 {
            let mut state = TicTacToe::new();
            let value = state.random_rollout(&mut rng);
            assert!((-1.0..=1.0).contains(&value));
        }
    }

    #[test]
    fn phase_tracks_move_count() {
        let early = TicTacToe::new();
        let late = TicTacToe::from_moves(&[0, 4, 8, 1, 7, 6]);
        assert_eq!(early.phase(3, GamePhaseDefinition::MoveCount), 0);
        assert!(late.phase(3, GamePhaseDefinition::MoveCount) >= 1);
        assert!(late.phase(3, GamePhaseDefinition::MoveCount) <= 2);
    }
}
