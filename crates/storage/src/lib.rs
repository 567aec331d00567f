// storage/src/lib.rs

//! Persistent Storage Layer
//!
//! Blocks are stored by hash, whatever branch they belong to. A separate
//! height index records the best chain and is rewritten atomically on every
//! tip change, together with the stored tip.

pub mod cache;
pub mod db;
pub mod memory;

pub use cache::BlockCache;
pub use db::{ColumnFamily, Database, DatabaseConfig};
pub use memory::MemoryStore;

use blockchain_core::{Block, BlockNumber};
use blockchain_crypto::Hash;
use serde::{Deserialize, Serialize};

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Best-chain tip as recorded in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTip {
    pub height: BlockNumber,
    pub hash: Hash,
}

/// Block persistence used by the consensus engine
pub trait BlockStore: Send + Sync {
    /// Store a block by hash. Storing a known block is a no-op.
    fn put_block(&self, block: &Block) -> StorageResult<()>;

    fn get_block(&self, hash: &Hash) -> StorageResult<Option<Block>>;

    fn contains_block(&self, hash: &Hash) -> StorageResult<bool> {
        Ok(self.get_block(hash)?.is_some())
    }

    /// Best-chain hash at `height`
    fn hash_at_height(&self, height: BlockNumber) -> StorageResult<Option<Hash>>;

    /// Best-chain block at `height`
    fn get_block_at_height(&self, height: BlockNumber) -> StorageResult<Option<Block>> {
        match self.hash_at_height(height)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    /// Replace the best chain from `from_height` upward with `hashes` and make
    /// the last of them the tip, in one atomic write. Index entries above the
    /// new tip are removed.
    fn set_best_chain(&self, from_height: BlockNumber, hashes: &[Hash]) -> StorageResult<()>;

    fn best_tip(&self) -> StorageResult<Option<StoredTip>>;
}

/// Tip implied by a best-chain rewrite, `None` for an empty rewrite
pub(crate) fn rewritten_tip(from_height: BlockNumber, hashes: &[Hash]) -> Option<StoredTip> {
    hashes.last().map(|hash| StoredTip {
        height: from_height + hashes.len() as u64 - 1,
        hash: *hash,
    })
}
