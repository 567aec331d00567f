// storage/src/db.rs

use crate::{cache::BlockCache, rewritten_tip, BlockStore, StorageError, StorageResult, StoredTip};
use blockchain_core::{Block, BlockNumber};
use blockchain_crypto::Hash;
use rocksdb::{Options, WriteBatch, DB};
use std::path::PathBuf;
use std::sync::Arc;

const TIP_KEY: &str = "best_tip";

/// Column families for different data types
#[derive(Debug, Clone, Copy)]
pub enum ColumnFamily {
    /// hash -> block, every branch
    Blocks,
    /// height -> hash, best chain only
    BlockHashes,
    Meta,
}

impl ColumnFamily {
    fn as_str(&self) -> &'static str {
        match self {
            ColumnFamily::Blocks => "blocks",
            ColumnFamily::BlockHashes => "block_hashes",
            ColumnFamily::Meta => "meta",
        }
    }

    fn all() -> Vec<Self> {
        vec![Self::Blocks, Self::BlockHashes, Self::Meta]
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub create_if_missing: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
    pub max_write_buffer_number: i32,
    /// Blocks kept in the read cache
    pub block_cache_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/chain"),
            create_if_missing: true,
            max_open_files: 1024,
            write_buffer_size: 64 * 1024 * 1024, // 64 MB
            max_write_buffer_number: 3,
            block_cache_size: 1024,
        }
    }
}

/// RocksDB-backed block store
pub struct Database {
    db: Arc<DB>,
    cache: BlockCache,
    config: DatabaseConfig,
}

impl Database {
    /// Open or create database
    pub fn open(config: DatabaseConfig) -> StorageResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.increase_parallelism(num_cpus::get() as i32);

        let cfs: Vec<_> = ColumnFamily::all().iter().map(|cf| cf.as_str()).collect();

        let db = DB::open_cf(&opts, &config.path, &cfs)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        tracing::info!("Database opened at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            cache: BlockCache::new(config.block_cache_size),
            config,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.config.path
    }

    /// Compact database
    pub fn compact(&self) -> StorageResult<()> {
        tracing::info!("Compacting database...");

        for cf_type in ColumnFamily::all() {
            let cf = self.cf(cf_type)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }

        tracing::info!("Database compaction complete");
        Ok(())
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let cf = self.cf(ColumnFamily::Meta)?;
        self.db.get_cf(cf, key.as_bytes())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    /// Get column family handle
    fn cf(&self, cf_type: ColumnFamily) -> StorageResult<&rocksdb::ColumnFamily> {
        self.db.cf_handle(cf_type.as_str())
            .ok_or_else(|| StorageError::DatabaseError(format!("{} CF not found", cf_type.as_str())))
    }
}

impl BlockStore for Database {
    fn put_block(&self, block: &Block) -> StorageResult<()> {
        let block_hash = block.hash();
        if self.contains_block(&block_hash)? {
            return Ok(());
        }

        let block_bytes = bincode::serialize(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let cf_blocks = self.cf(ColumnFamily::Blocks)?;
        self.db.put_cf(cf_blocks, block_hash.as_bytes(), &block_bytes)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        self.cache.insert(block_hash, block.clone());
        tracing::debug!("Stored block #{} ({})", block.height(), block_hash);
        Ok(())
    }

    fn get_block(&self, hash: &Hash) -> StorageResult<Option<Block>> {
        if let Some(block) = self.cache.get(hash) {
            return Ok(Some(block));
        }

        let cf = self.cf(ColumnFamily::Blocks)?;
        match self.db.get_cf(cf, hash.as_bytes())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))? {
            Some(bytes) => {
                let block: Block = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::SerializationError(e.to_string()))?;
                self.cache.insert(*hash, block.clone());
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    fn contains_block(&self, hash: &Hash) -> StorageResult<bool> {
        if self.cache.contains(hash) {
            return Ok(true);
        }
        let cf = self.cf(ColumnFamily::Blocks)?;
        self.db.get_pinned_cf(cf, hash.as_bytes())
            .map(|value| value.is_some())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    fn hash_at_height(&self, height: BlockNumber) -> StorageResult<Option<Hash>> {
        let cf = self.cf(ColumnFamily::BlockHashes)?;
        match self.db.get_cf(cf, height.to_be_bytes())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))? {
            Some(bytes) => Hash::from_slice(&bytes)
                .map(Some)
                .map_err(|_| StorageError::Corruption(format!("bad hash at height {}", height))),
            None => Ok(None),
        }
    }

    fn set_best_chain(&self, from_height: BlockNumber, hashes: &[Hash]) -> StorageResult<()> {
        let Some(new_tip) = rewritten_tip(from_height, hashes) else {
            return Ok(());
        };
        let old_tip = self.best_tip()?;

        let cf_hashes = self.cf(ColumnFamily::BlockHashes)?;
        let cf_meta = self.cf(ColumnFamily::Meta)?;
        let mut batch = WriteBatch::default();

        for (offset, hash) in hashes.iter().enumerate() {
            let height = from_height + offset as u64;
            batch.put_cf(cf_hashes, height.to_be_bytes(), hash.as_bytes());
        }
        if let Some(old) = old_tip {
            for height in (new_tip.height + 1)..=old.height {
                batch.delete_cf(cf_hashes, height.to_be_bytes());
            }
        }

        let tip_bytes = bincode::serialize(&new_tip)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        batch.put_cf(cf_meta, TIP_KEY.as_bytes(), tip_bytes);

        self.db.write(batch)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        tracing::debug!("Best chain now ends at #{} ({})", new_tip.height, new_tip.hash);
        Ok(())
    }

    fn best_tip(&self) -> StorageResult<Option<StoredTip>> {
        match self.get_meta(TIP_KEY)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corruption(format!("stored tip: {}", e))),
            None => Ok(None),
        }
    }
}
