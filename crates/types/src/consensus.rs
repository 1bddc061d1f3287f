//! Events describing block-level state mutation, as published by the
//! consensus collaborator.

use serde::{Deserialize, Serialize};

use crate::hash::{BlockId, OutputId, UnlockHash};
use crate::transaction::{CoinOutput, Transaction};

/// A block, reduced to what subscribers need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub parent_id: BlockId,
    pub height: u64,
    /// Transactions in block order. The miner payout pseudo-transaction,
    /// when present, carries the block's own id.
    pub transactions: Vec<Transaction>,
}

/// Whether a diff entry was created or rolled back by the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffDirection {
    Applied,
    Reverted,
}

/// A single output-level change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDiff {
    pub direction: DiffDirection,
    pub id: OutputId,
    pub output: CoinOutput,
}

/// A consensus change: the blocks reverted and applied by one chain
/// mutation, plus the per-output diffs it produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusChange {
    pub reverted_blocks: Vec<Block>,
    pub applied_blocks: Vec<Block>,
    pub coin_diffs: Vec<OutputDiff>,
    pub blockstake_diffs: Vec<OutputDiff>,
}

impl ConsensusChange {
    /// Every address mentioned by a coin or blockstake diff, in
    /// first-seen order, deduplicated.
    pub fn touched_addresses(&self) -> Vec<UnlockHash> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        for diff in self.coin_diffs.iter().chain(self.blockstake_diffs.iter()) {
            if seen.insert(diff.output.unlock_hash) {
                out.push(diff.output.unlock_hash);
            }
        }
        out
    }
}
