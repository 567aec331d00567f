// storage/src/cache.rs

use blockchain_core::Block;
use blockchain_crypto::Hash;
use std::collections::HashMap;
use std::sync::Mutex;

/// Recently read or written blocks, evicting the least recently touched
pub struct BlockCache {
    inner: Mutex<Recency>,
    capacity: usize,
}

#[derive(Default)]
struct Recency {
    /// Block and the tick it was last touched
    blocks: HashMap<Hash, (u64, Block)>,
    tick: u64,
}

impl Recency {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

impl BlockCache {
    /// Cache holding at most `capacity` blocks
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Recency::default()),
            capacity: capacity.max(1),
        }
    }

    /// Cached block, marked as recently used
    pub fn get(&self, hash: &Hash) -> Option<Block> {
        let mut inner = self.lock();
        let tick = inner.touch();
        inner.blocks.get_mut(hash).map(|(last, block)| {
            *last = tick;
            block.clone()
        })
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.lock().blocks.contains_key(hash)
    }

    /// Insert a block, evicting the least recently used one when full
    pub fn insert(&self, hash: Hash, block: Block) {
        let mut inner = self.lock();
        if inner.blocks.len() >= self.capacity && !inner.blocks.contains_key(&hash) {
            let oldest = inner
                .blocks
                .iter()
                .min_by_key(|(_, (last, _))| *last)
                .map(|(hash, _)| *hash);
            if let Some(oldest) = oldest {
                inner.blocks.remove(&oldest);
            }
        }
        let tick = inner.touch();
        inner.blocks.insert(hash, (tick, block));
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recency> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
