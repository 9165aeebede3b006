//! Value back-propagation along recorded trajectories.
//!
//! Each trajectory entry is an edge that had virtual loss applied during
//! selection; every backup reverts exactly one virtual-loss quantum per
//! edge, so an iteration is virtual-loss neutral once all of its
//! trajectories are consumed. The leaf value is negated at each level
//! because every edge Q is stored from the perspective of the node that
//! owns it.

use std::sync::Arc;

use crate::config::SearchSettings;
use crate::node::{ChildIdx, Node, NodeInner, NodeType};
use crate::worker::Trajectory;

/// Propagate `value` (from the leaf's side-to-move perspective) up the
/// trajectory. `leaf` receives a visit when the backup terminates at a real
/// leaf; transposition borrows pass `None` so the canonical node's own
/// statistics stay untouched.
pub(crate) fn backup_value(
    leaf: Option<&Arc<Node>>,
    value: f32,
    settings: &SearchSettings,
    trajectory: &Trajectory,
    solve_for_terminal: bool,
) {
    if let Some(leaf) = leaf {
        leaf.increment_visits();
    }
    let mut value = -value;
    for (node, idx) in trajectory.iter().rev() {
        {
            let mut inner = node.lock();
            node.revert_virtual_loss_and_backup(&mut inner, *idx, value, settings);
            if solve_for_terminal {
                try_solve_parent(node, &mut inner, *idx);
            }
        }
        node.increment_visits();
        value = -value;
    }
}

/// Revert the virtual loss of a trajectory whose leaf is still being
/// evaluated by another worker. No value and no visits are contributed.
pub(crate) fn backup_collision(settings: &SearchSettings, trajectory: &Trajectory) {
    for (node, idx) in trajectory.iter().rev() {
        let mut inner = node.lock();
        node.revert_virtual_loss(&mut inner, *idx, settings);
    }
}

/// Promote a node's solver state from the child it was just backed up
/// through. A child that is lost for its own side wins the parent; a parent
/// whose moves all lead to solved wins is itself lost; solved mixtures of
/// wins and draws make it drawn.
fn try_solve_parent(node: &Node, inner: &mut NodeInner, child_idx: ChildIdx) {
    if node.node_type() != NodeType::Unsolved {
        return;
    }
    let Some(child) = &inner.children[child_idx] else {
        return;
    };
    match child.node_type() {
        NodeType::SolvedLoss => {
            node.set_node_type(NodeType::SolvedWin);
            node.set_value(1.0);
        }
        NodeType::SolvedWin | NodeType::SolvedDraw => {
            if inner.children.iter().any(|c| c.is_none()) {
                return;
            }
            let mut all_win = true;
            for child in inner.children.iter().flatten() {
                match child.node_type() {
                    NodeType::SolvedWin => {}
                    NodeType::SolvedDraw => all_win = false,
                    _ => return,
                }
            }
            if all_win {
                node.set_node_type(NodeType::SolvedLoss);
                node.set_value(-1.0);
            } else {
                node.set_node_type(NodeType::SolvedDraw);
                node.set_value(0.0);
            }
        }
        NodeType::Unsolved | NodeType::Tablebase => {}
    }
}
