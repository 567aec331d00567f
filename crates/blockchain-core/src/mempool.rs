// blockchain-core/src/mempool.rs

use crate::{
    block::Block,
    transaction::{OutPoint, Transaction},
    BlockchainError, BlockchainResult, Timestamp,
};
use blockchain_crypto::Hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Transaction pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of transactions in pool
    pub max_size: usize,
    /// Maximum transaction age in seconds
    pub max_age: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_age: 3_600, // 1 hour
        }
    }
}

/// Pool metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total_transactions: usize,
    pub total_added: u64,
    pub total_removed: u64,
    pub total_conflicts: u64,
}

#[derive(Debug, Clone)]
struct PoolEntry {
    transaction: Transaction,
    added_at: Timestamp,
    sequence: u64,
}

/// Transaction pool (mempool) of loose transactions waiting for a block.
///
/// Only structural checks happen here; input existence and value balance are
/// checked against the chain when a block is assembled.
pub struct TransactionPool {
    config: PoolConfig,
    by_hash: HashMap<Hash, PoolEntry>,
    /// Arrival order
    by_sequence: BTreeMap<u64, Hash>,
    /// Outpoint -> pooled transaction spending it
    spends: HashMap<OutPoint, Hash>,
    next_sequence: u64,
    metrics: PoolMetrics,
}

impl TransactionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            by_hash: HashMap::new(),
            by_sequence: BTreeMap::new(),
            spends: HashMap::new(),
            next_sequence: 0,
            metrics: PoolMetrics::default(),
        }
    }

    /// Add transaction to pool
    pub fn add(&mut self, tx: Transaction, now: Timestamp) -> BlockchainResult<Hash> {
        tx.validate_basic()?;

        if tx.is_coinbase() || tx.is_coinstake() {
            return Err(BlockchainError::InvalidTransaction(
                "reward transactions are only valid inside blocks".into()
            ));
        }

        let txid = tx.txid();
        if self.by_hash.contains_key(&txid) {
            return Err(BlockchainError::DuplicateTransaction(txid));
        }

        if let Some(conflict) = tx.inputs.iter().find(|input| self.spends.contains_key(&input.prevout)) {
            self.metrics.total_conflicts += 1;
            return Err(BlockchainError::InvalidTransaction(
                format!("input {} already spent in pool", conflict.prevout)
            ));
        }

        if self.by_hash.len() >= self.config.max_size {
            return Err(BlockchainError::PoolFull);
        }

        for input in &tx.inputs {
            self.spends.insert(input.prevout, txid);
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.by_sequence.insert(sequence, txid);
        self.by_hash.insert(txid, PoolEntry {
            transaction: tx,
            added_at: now,
            sequence,
        });

        self.metrics.total_added += 1;
        self.metrics.total_transactions = self.by_hash.len();
        Ok(txid)
    }

    /// Up to `max_count` transactions in arrival order
    pub fn get_pending(&self, max_count: usize) -> Vec<Transaction> {
        self.by_sequence
            .values()
            .filter_map(|txid| self.by_hash.get(txid))
            .take(max_count)
            .map(|entry| entry.transaction.clone())
            .collect()
    }

    /// Remove transaction from pool
    pub fn remove(&mut self, txid: &Hash) -> Option<Transaction> {
        let entry = self.by_hash.remove(txid)?;
        self.by_sequence.remove(&entry.sequence);
        for input in &entry.transaction.inputs {
            self.spends.remove(&input.prevout);
        }

        self.metrics.total_removed += 1;
        self.metrics.total_transactions = self.by_hash.len();
        Some(entry.transaction)
    }

    /// Drop transactions a connected block included or made invalid
    pub fn remove_for_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.remove(&tx.txid());
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                if let Some(conflict) = self.spends.get(&input.prevout).copied() {
                    self.remove(&conflict);
                }
            }
        }
    }

    /// Return the non-reward transactions of a disconnected block to the pool
    pub fn readd_from_block(&mut self, block: &Block, now: Timestamp) {
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase() && !tx.is_coinstake()) {
            if let Err(e) = self.add(tx.clone(), now) {
                tracing::debug!("Dropping transaction {} from disconnected block: {}", tx.txid(), e);
            }
        }
    }

    /// Prune old transactions
    pub fn prune(&mut self, now: Timestamp) {
        let max_age = self.config.max_age;
        let expired: Vec<Hash> = self
            .by_hash
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.added_at) > max_age)
            .map(|(txid, _)| *txid)
            .collect();

        for txid in expired {
            self.remove(&txid);
        }
    }

    pub fn get(&self, txid: &Hash) -> Option<&Transaction> {
        self.by_hash.get(txid).map(|entry| &entry.transaction)
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.by_hash.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn clear(&mut self) {
        self.by_hash.clear();
        self.by_sequence.clear();
        self.spends.clear();
        self.metrics.total_transactions = 0;
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::ProofKind,
        transaction::{TxIn, TxOut},
        Amount,
    };
    use blockchain_crypto::KeyPair;

    fn create_test_tx(seed: u64, coins: u64) -> Transaction {
        let owner = KeyPair::generate().address();
        Transaction::new(
            vec![TxIn::spend(OutPoint::new(Hash::of(&seed), 0))],
            vec![TxOut::new(Amount::from_coins(coins), owner)],
            1_000,
        )
    }

    #[test]
    fn test_pool_add_and_order() {
        let mut pool = TransactionPool::default();
        let a = pool.add(create_test_tx(1, 5), 10).unwrap();
        let b = pool.add(create_test_tx(2, 7), 11).unwrap();

        let pending = pool.get_pending(10);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].txid(), a);
        assert_eq!(pending[1].txid(), b);
        assert_eq!(pool.get_pending(1).len(), 1);
    }

    #[test]
    fn test_pool_rejects_duplicates_and_conflicts() {
        let mut pool = TransactionPool::default();
        let tx = create_test_tx(1, 5);
        pool.add(tx.clone(), 10).unwrap();

        assert!(matches!(pool.add(tx, 10), Err(BlockchainError::DuplicateTransaction(_))));
        // Same input, different output
        assert!(pool.add(create_test_tx(1, 6), 10).is_err());
        assert_eq!(pool.metrics().total_conflicts, 1);
    }

    #[test]
    fn test_pool_rejects_reward_transactions() {
        let mut pool = TransactionPool::default();
        let owner = KeyPair::generate().address();
        let cb = Transaction::coinbase(3, vec![TxOut::new(Amount::from_coins(4), owner)], 10);
        assert!(pool.add(cb, 10).is_err());
    }

    #[test]
    fn test_pool_full() {
        let mut pool = TransactionPool::new(PoolConfig { max_size: 1, max_age: 60 });
        pool.add(create_test_tx(1, 5), 10).unwrap();
        assert!(matches!(pool.add(create_test_tx(2, 5), 10), Err(BlockchainError::PoolFull)));
    }

    #[test]
    fn test_remove_for_block() {
        let mut pool = TransactionPool::default();
        let included = create_test_tx(1, 5);
        let conflicting = create_test_tx(2, 5);
        pool.add(included.clone(), 10).unwrap();
        pool.add(conflicting.clone(), 10).unwrap();
        let untouched = pool.add(create_test_tx(3, 5), 10).unwrap();

        let rival = Transaction::new(
            conflicting.inputs.clone(),
            vec![TxOut::new(Amount::from_coins(1), KeyPair::generate().address())],
            2_000,
        );
        let owner = KeyPair::generate().address();
        let cb = Transaction::coinbase(1, vec![TxOut::new(Amount::from_coins(4), owner)], 10);
        let block = Block::new(Hash::zero(), 1, 10, 0x207fffff, ProofKind::Work, vec![cb, included, rival]);

        pool.remove_for_block(&block);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&untouched));
    }

    #[test]
    fn test_prune() {
        let mut pool = TransactionPool::new(PoolConfig { max_size: 10, max_age: 60 });
        pool.add(create_test_tx(1, 5), 0).unwrap();
        let fresh = pool.add(create_test_tx(2, 5), 100).unwrap();

        pool.prune(120);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&fresh));
    }
}
