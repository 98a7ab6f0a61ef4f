//! Chain reorganization planning
//!
//! Switching the active chain to another branch is a sequence of single
//! block steps: disconnect from the current tip down to the fork point,
//! then connect forward to the target. Each step commits or aborts on its
//! own, so a failure partway leaves the engine on a fully connected chain.

use std::fmt;

use crate::block_index::BlockIndex;
use crate::types::*;

/// Blocks to walk through to move the active tip to a new entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationPlan {
    /// Last block shared by both chains
    pub fork: usize,
    /// Active blocks above the fork, tip first
    pub disconnect: Vec<usize>,
    /// Target branch above the fork, lowest first
    pub connect: Vec<usize>,
}

impl ActivationPlan {
    pub fn is_reorg(&self) -> bool {
        !self.disconnect.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.disconnect.len()
    }
}

/// ShouldReorganize: candidate × tip → {true, false}
///
/// A candidate replaces the active tip when it has more cumulative work.
/// At equal work the block whose data arrived first keeps its place, so a
/// later competitor never displaces the tip; the earlier one only wins
/// back after the engine had to fall off it.
pub fn should_reorganize(index: &BlockIndex, candidate: usize) -> bool {
    let tip = index.tip();
    candidate != tip && index.outranks(candidate, tip)
}

/// PlanActivation: BlockIndex × target → ActivationPlan
///
/// 1. fork = FindCommonAncestor(tip, target)
/// 2. disconnect = active blocks from tip down to (excluding) fork
/// 3. connect = target's ancestors from fork + 1 up to target
pub fn plan_activation(index: &BlockIndex, target: usize) -> ActivationPlan {
    let tip = index.tip();
    let fork = index.find_common_ancestor(tip, target);
    let fork_height = index.entry(fork).height;

    let disconnect: Vec<usize> = ((fork_height + 1)..=index.active_height())
        .rev()
        .filter_map(|height| index.active_at(height))
        .collect();

    let mut connect = Vec::new();
    let mut cursor = target;
    while cursor != fork {
        connect.push(cursor);
        match index.entry(cursor).parent {
            Some(parent) => cursor = parent,
            None => break,
        }
    }
    connect.reverse();

    ActivationPlan {
        fork,
        disconnect,
        connect,
    }
}

/// A reorganization that stopped at an invalid block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgAbort {
    pub failed_block: Hash,
    pub failed_height: Natural,
    pub reason: String,
    /// Tip the engine settled on after the failure
    pub stable_tip: Hash,
    pub stable_height: Natural,
}

impl fmt::Display for ReorgAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reorg aborted at block {} (height {}): {}; stable tip {} at height {}",
            hash_to_hex(&self.failed_block),
            self.failed_height,
            self.reason,
            hash_to_hex(&self.stable_tip),
            self.stable_height
        )
    }
}
