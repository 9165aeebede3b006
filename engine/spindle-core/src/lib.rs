//! Core abstractions for the Spindle game-playing engine.
//!
//! This crate defines the seam between game implementations and the search:
//! - [`GameState`]: object-safe trait the search drives positions through
//! - [`Action`], [`SideToMove`], [`TerminalKind`]: the vocabulary of a game
//! - [`GamePhase`] / [`GamePhaseDefinition`]: phase routing for
//!   phase-specialist networks
//! - [`TwoPlayerPlanes`]: shared network input layout for two-player board
//!   games

pub mod phase;
pub mod planes;
pub mod state;

pub use phase::{clamp_phase, GamePhase, GamePhaseDefinition};
pub use planes::TwoPlayerPlanes;
pub use state::{Action, GameState, SideToMove, TerminalKind};
