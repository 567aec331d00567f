// storage/src/memory.rs

use crate::{rewritten_tip, BlockStore, StorageError, StorageResult, StoredTip};
use blockchain_core::{Block, BlockNumber};
use blockchain_crypto::Hash;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Default)]
struct Inner {
    blocks: HashMap<Hash, Block>,
    heights: BTreeMap<BlockNumber, Hash>,
    tip: Option<StoredTip>,
}

/// Block store kept entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// When set, every write fails with a database error
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, for exercising storage-error paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of block writes that actually stored something
    pub fn block_writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn block_count(&self) -> usize {
        self.read().blocks.len()
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::DatabaseError("write rejected".into()));
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlockStore for MemoryStore {
    fn put_block(&self, block: &Block) -> StorageResult<()> {
        self.check_writable()?;
        let hash = block.hash();
        let mut inner = self.write();
        if !inner.blocks.contains_key(&hash) {
            inner.blocks.insert(hash, block.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn get_block(&self, hash: &Hash) -> StorageResult<Option<Block>> {
        Ok(self.read().blocks.get(hash).cloned())
    }

    fn contains_block(&self, hash: &Hash) -> StorageResult<bool> {
        Ok(self.read().blocks.contains_key(hash))
    }

    fn hash_at_height(&self, height: BlockNumber) -> StorageResult<Option<Hash>> {
        Ok(self.read().heights.get(&height).copied())
    }

    fn set_best_chain(&self, from_height: BlockNumber, hashes: &[Hash]) -> StorageResult<()> {
        self.check_writable()?;
        let Some(new_tip) = rewritten_tip(from_height, hashes) else {
            return Ok(());
        };

        let mut inner = self.write();
        inner.heights.split_off(&from_height);
        for (offset, hash) in hashes.iter().enumerate() {
            inner.heights.insert(from_height + offset as u64, *hash);
        }
        inner.tip = Some(new_tip);
        Ok(())
    }

    fn best_tip(&self) -> StorageResult<Option<StoredTip>> {
        Ok(self.read().tip)
    }
}
