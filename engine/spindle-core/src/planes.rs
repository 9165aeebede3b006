//! Network input planes for two-player board games.
//!
//! Most small board games encode the same three plane groups: a one-hot
//! board view per player, a legal-move plane and a side-to-move plane. This
//! helper writes that layout so individual games only supply their board
//! cells and legal mask.

use crate::state::SideToMove;

/// Plane layout for a two-player board game.
///
/// - `BOARD_VIEW_SIZE`: total size of the one-hot board encoding
///   (`board_size * 2`, one view per player)
/// - `NUM_ACTIONS`: number of board positions / actions
pub struct TwoPlayerPlanes<const BOARD_VIEW_SIZE: usize, const NUM_ACTIONS: usize>;

impl<const BOARD_VIEW_SIZE: usize, const NUM_ACTIONS: usize>
    TwoPlayerPlanes<BOARD_VIEW_SIZE, NUM_ACTIONS>
{
    /// Total number of floats one position occupies.
    pub const fn plane_values() -> usize {
        BOARD_VIEW_SIZE + NUM_ACTIONS + 2
    }

    /// Write the planes for a position into `out`.
    ///
    /// `board` holds cell values (0 = empty, 1 = first player, 2 = second
    /// player); `legal_mask` has bit `i` set when action `i` is legal.
    pub fn write(board: &[u8], legal_mask: u64, side: SideToMove, out: &mut [f32]) {
        assert_eq!(out.len(), Self::plane_values());
        out.fill(0.0);

        let board_size = BOARD_VIEW_SIZE / 2;
        for (i, &cell) in board.iter().enumerate() {
            if cell == 1 {
                out[i] = 1.0;
            } else if cell == 2 {
                out[i + board_size] = 1.0;
            }
        }

        let legal_offset = BOARD_VIEW_SIZE;
        for pos in 0..NUM_ACTIONS {
            if (legal_mask >> pos) & 1 == 1 {
                out[legal_offset + pos] = 1.0;
            }
        }

        let side_offset = BOARD_VIEW_SIZE + NUM_ACTIONS;
        match side {
            SideToMove::First => out[side_offset] = 1.0,
            SideToMove::Second => out[side_offset + 1] = 1.0,
        }
    }
}
