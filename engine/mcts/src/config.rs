//! Search configuration and limits.

use serde::{Deserialize, Serialize};
use spindle_core::GamePhaseDefinition;

/// Whether the searched game alternates sides between plies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPlayerMode {
    /// Puzzle-style search where the same side keeps moving.
    SinglePlayer,
    /// Adversarial two-player search.
    TwoPlayer,
}

/// How leaves are valued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchMode {
    /// Batched neural network evaluation.
    Neural,
    /// Random rollouts at expansion time, no network involved.
    Rollout,
}

/// Tunable parameters of the worker loop.
///
/// The struct is plain data so outer layers can load it from `config.toml`
/// or override single fields through the builder methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Mini-batch capacity for network evaluation.
    pub batch_size: usize,

    pub search_player_mode: SearchPlayerMode,

    pub search_mode: SearchMode,

    /// Virtual-loss quantum applied per selected edge.
    pub virtual_loss: u32,

    /// Exploration constant of the PUCT selection formula.
    pub c_puct: f32,

    /// With probability `1 / epsilon_greedy_counter` an iteration starts as
    /// a random playout instead of deterministic selection. 0 disables.
    pub epsilon_greedy_counter: u32,

    /// With probability `1 / epsilon_checks_counter` an iteration probes for
    /// an unexplored checking move. 0 disables. Only consulted when the
    /// random-playout branch was not taken.
    pub epsilon_checks_counter: u32,

    /// Consult the transposition map in rollout mode. Neural mode always
    /// uses the map.
    pub use_transposition_table: bool,

    /// Propagate solved and tablebase states during backup.
    pub mcts_solver: bool,

    /// Raise the prior of unexplored checking moves.
    pub enhance_checks: bool,

    /// Temperature applied to the prior policy after evaluation.
    pub node_policy_temperature: f32,

    /// Number of game phases used for network routing.
    pub num_phases: usize,

    pub game_phase_definition: GamePhaseDefinition,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            search_player_mode: SearchPlayerMode::TwoPlayer,
            search_mode: SearchMode::Neural,
            virtual_loss: 1,
            c_puct: 2.5,
            epsilon_greedy_counter: 0,
            epsilon_checks_counter: 0,
            use_transposition_table: true,
            mcts_solver: true,
            enhance_checks: false,
            node_policy_temperature: 1.0,
            num_phases: 1,
            game_phase_definition: GamePhaseDefinition::MoveCount,
        }
    }
}

impl SearchSettings {
    /// Small-batch settings for fast deterministic tests.
    pub fn for_testing() -> Self {
        Self {
            batch_size: 8,
            ..Self::default()
        }
    }

    /// How many terminal leaves one mini-batch may absorb before it is
    /// dispatched. Single-player search caps this at one because repeated
    /// same-side terminals compound instead of alternating.
    pub fn terminal_node_cache(&self) -> usize {
        match self.search_player_mode {
            SearchPlayerMode::SinglePlayer => 1,
            SearchPlayerMode::TwoPlayer => 2 * self.batch_size,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_search_mode(mut self, mode: SearchMode) -> Self {
        self.search_mode = mode;
        self
    }

    pub fn with_player_mode(mut self, mode: SearchPlayerMode) -> Self {
        self.search_player_mode = mode;
        self
    }

    pub fn with_epsilon_greedy(mut self, counter: u32) -> Self {
        self.epsilon_greedy_counter = counter;
        self
    }

    pub fn with_epsilon_checks(mut self, counter: u32) -> Self {
        self.epsilon_checks_counter = counter;
        self
    }

    pub fn with_solver(mut self, enabled: bool) -> Self {
        self.mcts_solver = enabled;
        self
    }

    pub fn with_virtual_loss(mut self, virtual_loss: u32) -> Self {
        self.virtual_loss = virtual_loss;
        self
    }
}

/// Upper bounds on one search. A limit of 0 means unbounded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SearchLimits {
    /// Maximum tree size in nodes.
    pub nodes: u64,
    /// Maximum number of root visits.
    pub simulations: u64,
    /// Hard secondary cap on tree size.
    pub nodes_limit: u64,
}

impl SearchLimits {
    pub fn with_simulations(mut self, simulations: u64) -> Self {
        self.simulations = simulations;
        self
    }

    pub fn with_nodes(mut self, nodes: u64) -> Self {
        self.nodes = nodes;
        self
    }
}
