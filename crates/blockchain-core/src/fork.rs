// blockchain-core/src/fork.rs

use crate::{target::ChainWork, BlockNumber, BlockchainError, BlockchainResult};
use blockchain_crypto::Hash;
use serde::{Deserialize, Serialize};

/// Position of a block in the block tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLink {
    pub parent: Hash,
    pub height: BlockNumber,
}

/// Fork resolver for handling chain reorganizations
///
/// Fork choice is heaviest cumulative work; ties keep the current chain.
#[derive(Debug, Clone)]
pub struct ForkResolver {
    /// Maximum reorg depth allowed
    max_reorg_depth: u64,
}

impl ForkResolver {
    pub fn new(max_reorg_depth: u64) -> Self {
        Self { max_reorg_depth }
    }

    /// Whether a chain with `candidate` work replaces one with `current` work
    pub fn prefers(&self, current: &ChainWork, candidate: &ChainWork) -> bool {
        candidate > current
    }

    /// Find the common ancestor of two heads in the block tree
    pub fn find_common_ancestor<F>(&self, lookup: F, head_a: &Hash, head_b: &Hash) -> Option<Hash>
    where
        F: Fn(&Hash) -> Option<TreeLink>,
    {
        let mut a = *head_a;
        let mut b = *head_b;
        let mut link_a = lookup(&a)?;
        let mut link_b = lookup(&b)?;

        while link_a.height > link_b.height {
            a = link_a.parent;
            link_a = lookup(&a)?;
        }
        while link_b.height > link_a.height {
            b = link_b.parent;
            link_b = lookup(&b)?;
        }
        while a != b {
            if link_a.height == 0 {
                // Distinct genesis blocks
                return None;
            }
            a = link_a.parent;
            b = link_b.parent;
            link_a = lookup(&a)?;
            link_b = lookup(&b)?;
        }

        Some(a)
    }

    /// Calculate the blocks to disconnect and connect to move from `old_head` to `new_head`
    pub fn calculate_reorg_path<F>(&self, lookup: F, old_head: &Hash, new_head: &Hash) -> BlockchainResult<ReorgPath>
    where
        F: Fn(&Hash) -> Option<TreeLink>,
    {
        let common_ancestor = self
            .find_common_ancestor(&lookup, old_head, new_head)
            .ok_or_else(|| BlockchainError::InvalidChain("no common ancestor".into()))?;

        let mut disconnect = Vec::new();
        let mut current = *old_head;
        while current != common_ancestor {
            let link = lookup(&current).ok_or(BlockchainError::BlockNotFound(current))?;
            disconnect.push(current);
            current = link.parent;

            if disconnect.len() as u64 > self.max_reorg_depth {
                return Err(BlockchainError::ReorgTooDeep {
                    depth: disconnect.len() as u64,
                });
            }
        }

        let mut connect = Vec::new();
        let mut current = *new_head;
        while current != common_ancestor {
            let link = lookup(&current).ok_or(BlockchainError::BlockNotFound(current))?;
            connect.push(current);
            current = link.parent;
        }
        connect.reverse();

        Ok(ReorgPath {
            common_ancestor,
            disconnect,
            connect,
        })
    }

    pub fn max_reorg_depth(&self) -> u64 {
        self.max_reorg_depth
    }
}

/// Reorganization path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgPath {
    pub common_ancestor: Hash,
    /// Blocks to disconnect, tip first
    pub disconnect: Vec<Hash>,
    /// Blocks to connect, ancestor first
    pub connect: Vec<Hash>,
}

impl ReorgPath {
    /// Plain extension of the current tip
    pub fn is_extension(&self) -> bool {
        self.disconnect.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.disconnect.len()
    }
}
