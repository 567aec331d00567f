// consensus/src/engine.rs

//! Chain engine: the single writer of the chain tip.
//!
//! All validation and tip mutation happens under one mutex. The tip is
//! published through a `watch` channel only after the block store and the
//! in-memory state both reflect it, so readers never see a half-applied
//! reorganization.

use crate::{
    clock::{Clock, SystemClock},
    interfaces::ChainObserver,
    kernel::{FixedTarget, TargetPolicy},
    rules::{self, BlockContext, RejectReason, PREV_NOT_FOUND},
    ConsensusError, ConsensusResult,
};
use blockchain_core::{
    Amount, Block, BlockHeader, BlockNumber, BlockUndo, BlockchainError, ChainWork, Coin,
    ConsensusParameters, ForkResolver, OutPoint, ProofKind, Timestamp, Transaction,
    TransactionPool, TreeLink, UtxoSet,
};
use blockchain_crypto::{Address, Hash};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use storage::{BlockStore, StorageError, StorageResult};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Reference to the best fully validated block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub hash: Hash,
    pub height: BlockNumber,
    pub chain_work: ChainWork,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedBlock {
    pub hash: Hash,
    pub height: BlockNumber,
    /// The block had been accepted before; nothing changed
    pub already_known: bool,
    /// The block is now the tip
    pub became_tip: bool,
    /// Blocks disconnected to make it the tip
    pub disconnected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVerdict {
    Accepted(AcceptedBlock),
    Rejected(RejectReason),
}

impl BlockVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BlockVerdict::Accepted(_))
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            BlockVerdict::Rejected(reason) => Some(reason),
            BlockVerdict::Accepted(_) => None,
        }
    }
}

/// Loose transactions for the next block and the fees they pay
#[derive(Debug, Clone, Default)]
pub struct BlockTemplate {
    pub transactions: Vec<Transaction>,
    pub fees: Amount,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    header: BlockHeader,
    chain_work: ChainWork,
}

/// The best chain with its coin set and undo data
#[derive(Debug, Clone, Default)]
struct ActiveChain {
    /// Best-chain hashes by height
    hashes: Vec<Hash>,
    utxo: UtxoSet,
    undo: HashMap<Hash, BlockUndo>,
}

struct ChainState {
    /// Every stored, not known-invalid block
    index: HashMap<Hash, IndexEntry>,
    invalid: HashMap<Hash, RejectReason>,
    active: ActiveChain,
    tip: ChainTip,
    mempool: TransactionPool,
    halted: bool,
}

pub struct ChainEngine {
    params: Arc<ConsensusParameters>,
    store: Arc<dyn BlockStore>,
    clock: Arc<dyn Clock>,
    target_policy: Arc<dyn TargetPolicy>,
    fork: ForkResolver,
    state: Mutex<ChainState>,
    tip_tx: watch::Sender<ChainTip>,
    observers: RwLock<Vec<Arc<dyn ChainObserver>>>,
}

impl ChainEngine {
    pub fn open(params: Arc<ConsensusParameters>, store: Arc<dyn BlockStore>) -> ConsensusResult<Self> {
        Self::open_with(params, store, Arc::new(SystemClock), Arc::new(FixedTarget))
    }

    /// Load the stored best chain, or initialize the store with genesis
    pub fn open_with(
        params: Arc<ConsensusParameters>,
        store: Arc<dyn BlockStore>,
        clock: Arc<dyn Clock>,
        target_policy: Arc<dyn TargetPolicy>,
    ) -> ConsensusResult<Self> {
        let genesis = Block::genesis(&params);

        if store.best_tip()?.is_none() {
            store.put_block(&genesis)?;
            store.set_best_chain(0, &[genesis.hash()])?;
            info!("Initialized {} chain with genesis {}", params.network, genesis.hash());
        } else if store.hash_at_height(0)? != Some(genesis.hash()) {
            return Err(ConsensusError::Config(format!(
                "block store does not hold the {} chain",
                params.network
            )));
        }

        let stored_tip = store
            .best_tip()?
            .ok_or_else(|| StorageError::Corruption("no best tip after initialization".into()))?;

        let mut index = HashMap::new();
        let mut active = ActiveChain::default();
        let mut chain_work = ChainWork::zero();
        let mut tip_time = genesis.header.timestamp;

        for height in 0..=stored_tip.height {
            let block = store.get_block_at_height(height)?.ok_or_else(|| {
                StorageError::Corruption(format!("missing best-chain block at height {}", height))
            })?;
            let hash = block.hash();
            chain_work = &chain_work + &ChainWork::from_bits(block.header.bits);
            let undo = active.utxo.apply_block(&block)?;
            active.undo.insert(hash, undo);
            active.hashes.push(hash);
            tip_time = block.header.timestamp;
            index.insert(hash, IndexEntry {
                header: block.header,
                chain_work: chain_work.clone(),
            });
        }

        let tip = ChainTip {
            hash: stored_tip.hash,
            height: stored_tip.height,
            chain_work,
            timestamp: tip_time,
        };
        info!("Chain loaded at height {} ({}), {} unspent coins", tip.height, tip.hash, active.utxo.len());

        let (tip_tx, _) = watch::channel(tip.clone());
        let fork = ForkResolver::new(params.max_reorg_depth);

        Ok(Self {
            params,
            store,
            clock,
            target_policy,
            fork,
            state: Mutex::new(ChainState {
                index,
                invalid: HashMap::new(),
                active,
                tip,
                mempool: TransactionPool::default(),
                halted: false,
            }),
            tip_tx,
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn params(&self) -> &Arc<ConsensusParameters> {
        &self.params
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn add_observer(&self, observer: Arc<dyn ChainObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Validate `block` and, when it carries the most work, make it the tip
    pub fn submit_block(&self, block: Block) -> ConsensusResult<BlockVerdict> {
        self.submit(block, None)
    }

    /// Like `submit_block`, but fails with `StaleTip` unless the tip is still `expected_tip`
    pub fn submit_if_tip(&self, block: Block, expected_tip: &Hash) -> ConsensusResult<BlockVerdict> {
        self.submit(block, Some(*expected_tip))
    }

    fn submit(&self, block: Block, expected_tip: Option<Hash>) -> ConsensusResult<BlockVerdict> {
        let hash = block.hash();
        let height = block.height();

        if let Err(reason) = rules::check_pow_cutoff(&block.header, &self.params) {
            warn!("Rejected block #{} ({}): {}", height, hash, reason);
            return Ok(BlockVerdict::Rejected(reason));
        }

        let mut state = self.lock()?;
        if state.halted {
            return Err(ConsensusError::Halted);
        }
        if let Some(expected) = expected_tip {
            if state.tip.hash != expected {
                return Err(ConsensusError::StaleTip {
                    expected,
                    actual: state.tip.hash,
                });
            }
        }

        if let Some(reason) = state.invalid.get(&hash) {
            return Ok(BlockVerdict::Rejected(reason.clone()));
        }
        if state.index.contains_key(&hash) {
            debug!("Block #{} ({}) already known", height, hash);
            return Ok(BlockVerdict::Accepted(AcceptedBlock {
                hash,
                height,
                already_known: true,
                became_tip: false,
                disconnected: 0,
            }));
        }

        let parent_hash = block.header.parent_hash;
        if state.invalid.contains_key(&parent_hash) {
            return Ok(self.reject(&mut state, &block, RejectReason::new("parent block invalid")));
        }
        let Some(parent) = state.index.get(&parent_hash).cloned() else {
            debug!("Block #{} ({}) has unknown parent {}", height, hash, parent_hash);
            return Ok(BlockVerdict::Rejected(RejectReason::new(PREV_NOT_FOUND)));
        };

        let ctx = BlockContext {
            params: &self.params,
            parent: &parent.header,
            parent_hash: &parent_hash,
            now: self.clock.now(),
            expected_bits: self.target_policy.next_bits(&self.params, &parent.header, block.header.proof),
        };
        let early = rules::check_header(&block, &ctx)
            .and_then(|_| rules::check_structure(&block))
            .and_then(|_| match block.header.proof {
                ProofKind::Work => rules::check_proof_of_work(&block),
                ProofKind::Stake => Ok(()),
            });
        if let Err(reason) = early {
            return Ok(self.reject(&mut state, &block, reason));
        }

        let chain_work = &parent.chain_work + &ChainWork::from_bits(block.header.bits);

        if parent_hash == state.tip.hash {
            if let Err(reason) = rules::check_block_contents(&block, &ctx, &state.active.utxo) {
                return Ok(self.reject(&mut state, &block, reason));
            }
            return self.extend_tip(&mut state, block, chain_work);
        }

        let stored = self.store.put_block(&block);
        self.persist(&mut state, stored)?;
        state.index.insert(hash, IndexEntry {
            header: block.header.clone(),
            chain_work: chain_work.clone(),
        });

        if !self.fork.prefers(&state.tip.chain_work, &chain_work) {
            info!("Stored side-branch block #{} ({})", height, hash);
            return Ok(BlockVerdict::Accepted(AcceptedBlock {
                hash,
                height,
                already_known: false,
                became_tip: false,
                disconnected: 0,
            }));
        }

        self.reorganize(&mut state, block)
    }

    /// Connect a fully validated child of the tip
    fn extend_tip(&self, state: &mut ChainState, block: Block, chain_work: ChainWork) -> ConsensusResult<BlockVerdict> {
        let hash = block.hash();
        let height = block.height();

        let stored = self.store.put_block(&block);
        self.persist(state, stored)?;
        let indexed = self.store.set_best_chain(height, &[hash]);
        self.persist(state, indexed)?;

        let undo = match state.active.utxo.apply_block(&block) {
            Ok(undo) => undo,
            Err(e) => {
                error!("Validated block #{} failed to apply, halting: {}", height, e);
                state.halted = true;
                return Err(e.into());
            }
        };
        state.active.undo.insert(hash, undo);
        state.active.hashes.push(hash);
        state.index.insert(hash, IndexEntry {
            header: block.header.clone(),
            chain_work: chain_work.clone(),
        });
        state.mempool.remove_for_block(&block);
        state.tip = ChainTip {
            hash,
            height,
            chain_work,
            timestamp: block.header.timestamp,
        };
        self.tip_tx.send_replace(state.tip.clone());

        info!(
            "✓ Accepted block #{} ({}) {:?}, {} transactions",
            height,
            hash,
            block.header.proof,
            block.transactions.len()
        );
        self.notify(&[], std::slice::from_ref(&block));

        Ok(BlockVerdict::Accepted(AcceptedBlock {
            hash,
            height,
            already_known: false,
            became_tip: true,
            disconnected: 0,
        }))
    }

    /// Switch to the heavier branch ending in `block`. All work happens on a
    /// copy of the active chain that replaces the original only on success.
    fn reorganize(&self, state: &mut ChainState, block: Block) -> ConsensusResult<BlockVerdict> {
        let new_hash = block.hash();
        let old_tip = state.tip.clone();

        let path = {
            let index = &state.index;
            let lookup = |hash: &Hash| {
                index.get(hash).map(|entry| TreeLink {
                    parent: entry.header.parent_hash,
                    height: entry.header.height,
                })
            };
            self.fork.calculate_reorg_path(lookup, &old_tip.hash, &new_hash)
        };
        let path = match path {
            Ok(path) => path,
            Err(BlockchainError::ReorgTooDeep { depth }) => {
                warn!("Refusing reorganization of {} blocks to {}", depth, new_hash);
                return Ok(BlockVerdict::Rejected(RejectReason::new("reorganization too deep")));
            }
            Err(e) => {
                warn!("Branch ending in {} cannot be connected: {}", new_hash, e);
                return Ok(BlockVerdict::Rejected(RejectReason::new("branch not connectable")));
            }
        };

        let mut scratch = state.active.clone();
        let mut disconnected = Vec::with_capacity(path.disconnect.len());
        for hash in &path.disconnect {
            let old = self.load_block(state, hash)?;
            let undo = scratch.undo.remove(hash).ok_or_else(|| {
                BlockchainError::InvalidChain(format!("no undo data for {}", hash))
            })?;
            scratch.utxo.undo_block(undo);
            scratch.hashes.pop();
            disconnected.push(old);
        }

        let now = self.clock.now();
        let mut connected = Vec::with_capacity(path.connect.len());
        for (position, hash) in path.connect.iter().enumerate() {
            let candidate = if *hash == new_hash {
                block.clone()
            } else {
                self.load_block(state, hash)?
            };
            let parent = state
                .index
                .get(&candidate.header.parent_hash)
                .map(|entry| entry.header.clone())
                .ok_or(BlockchainError::BlockNotFound(candidate.header.parent_hash))?;
            let ctx = BlockContext {
                params: &self.params,
                parent: &parent,
                parent_hash: &candidate.header.parent_hash,
                now,
                expected_bits: self.target_policy.next_bits(&self.params, &parent, candidate.header.proof),
            };

            if let Err(reason) = rules::check_block_contents(&candidate, &ctx, &scratch.utxo) {
                warn!(
                    "Reorganization to {} failed at block #{} ({}): {}",
                    new_hash,
                    candidate.height(),
                    hash,
                    reason
                );
                for bad in &path.connect[position..] {
                    state.index.remove(bad);
                    state.invalid.insert(*bad, reason.clone());
                }
                return Ok(BlockVerdict::Rejected(reason));
            }

            let undo = scratch.utxo.apply_block(&candidate)?;
            scratch.undo.insert(*hash, undo);
            scratch.hashes.push(*hash);
            connected.push(candidate);
        }

        let fork_height = scratch.hashes.len() as u64 - path.connect.len() as u64;
        let indexed = self.store.set_best_chain(fork_height, &path.connect);
        self.persist(state, indexed)?;

        let tip_entry = state
            .index
            .get(&new_hash)
            .cloned()
            .ok_or(BlockchainError::BlockNotFound(new_hash))?;
        state.active = scratch;
        state.tip = ChainTip {
            hash: new_hash,
            height: tip_entry.header.height,
            chain_work: tip_entry.chain_work,
            timestamp: tip_entry.header.timestamp,
        };
        for old in &disconnected {
            state.mempool.readd_from_block(old, now);
        }
        for new in &connected {
            state.mempool.remove_for_block(new);
        }
        self.tip_tx.send_replace(state.tip.clone());

        info!(
            "Reorganized from #{} ({}) to #{} ({}): {} disconnected, {} connected",
            old_tip.height,
            old_tip.hash,
            state.tip.height,
            state.tip.hash,
            disconnected.len(),
            connected.len()
        );
        self.notify(&disconnected, &connected);

        Ok(BlockVerdict::Accepted(AcceptedBlock {
            hash: new_hash,
            height: state.tip.height,
            already_known: false,
            became_tip: true,
            disconnected: disconnected.len(),
        }))
    }

    fn reject(&self, state: &mut ChainState, block: &Block, reason: RejectReason) -> BlockVerdict {
        let hash = block.hash();
        warn!("Rejected block #{} ({}): {}", block.height(), hash, reason);
        if !reason.is_transient() {
            state.invalid.insert(hash, reason.clone());
        }
        BlockVerdict::Rejected(reason)
    }

    /// Storage failures halt the engine until restart
    fn persist<T>(&self, state: &mut ChainState, result: StorageResult<T>) -> ConsensusResult<T> {
        result.map_err(|e| {
            error!("Block store failure, halting chain engine: {}", e);
            state.halted = true;
            ConsensusError::Storage(e)
        })
    }

    fn load_block(&self, state: &mut ChainState, hash: &Hash) -> ConsensusResult<Block> {
        let loaded = self.store.get_block(hash);
        match self.persist(state, loaded)? {
            Some(block) => Ok(block),
            None => {
                state.halted = true;
                Err(StorageError::NotFound(format!("indexed block {}", hash)).into())
            }
        }
    }

    fn notify(&self, disconnected: &[Block], connected: &[Block]) {
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        for block in disconnected {
            for observer in observers.iter() {
                observer.block_disconnected(block);
            }
        }
        for block in connected {
            for observer in observers.iter() {
                observer.block_connected(block);
            }
        }
    }

    fn lock(&self) -> ConsensusResult<MutexGuard<'_, ChainState>> {
        self.state.lock().map_err(|_| ConsensusError::Halted)
    }

    // ==================== READS ====================

    pub fn tip(&self) -> ChainTip {
        self.tip_tx.borrow().clone()
    }

    pub fn subscribe_tip(&self) -> watch::Receiver<ChainTip> {
        self.tip_tx.subscribe()
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().map(|state| state.halted).unwrap_or(true)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.state
            .lock()
            .map(|state| state.index.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn header(&self, hash: &Hash) -> Option<BlockHeader> {
        let state = self.state.lock().ok()?;
        state.index.get(hash).map(|entry| entry.header.clone())
    }

    pub fn block(&self, hash: &Hash) -> ConsensusResult<Option<Block>> {
        if !self.contains(hash) {
            return Ok(None);
        }
        Ok(self.store.get_block(hash)?)
    }

    /// Best-chain block at `height`
    pub fn block_at_height(&self, height: BlockNumber) -> ConsensusResult<Option<Block>> {
        let hash = {
            let state = self.lock()?;
            state.active.hashes.get(height as usize).copied()
        };
        match hash {
            Some(hash) => Ok(self.store.get_block(&hash)?),
            None => Ok(None),
        }
    }

    /// Best-chain hashes from the tip back to genesis: ten consecutive, then
    /// exponentially spaced
    pub fn locator(&self) -> ConsensusResult<Vec<Hash>> {
        let state = self.lock()?;
        let hashes = &state.active.hashes;
        let mut locator = Vec::new();
        let mut height = hashes.len() as i64 - 1;
        let mut step = 1i64;

        while height > 0 {
            locator.push(hashes[height as usize]);
            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        if let Some(genesis) = hashes.first() {
            locator.push(*genesis);
        }
        Ok(locator)
    }

    /// Up to `max` best-chain blocks after the first locator hash found on the
    /// best chain, ancestor first
    pub fn blocks_after(&self, locator: &[Hash], max: usize) -> ConsensusResult<Vec<Block>> {
        let hashes: Vec<Hash> = {
            let state = self.lock()?;
            let start = locator
                .iter()
                .find_map(|hash| {
                    let entry = state.index.get(hash)?;
                    let height = entry.header.height as usize;
                    (state.active.hashes.get(height) == Some(hash)).then_some(height + 1)
                })
                .unwrap_or(1);
            state.active.hashes.iter().skip(start).take(max).copied().collect()
        };

        let mut blocks = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let block = self
                .store
                .get_block(&hash)?
                .ok_or_else(|| StorageError::NotFound(format!("best-chain block {}", hash)))?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    pub fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        let state = self.state.lock().ok()?;
        state.active.utxo.get(outpoint).cloned()
    }

    pub fn coins_owned_by(&self, owner: &Address) -> Vec<Coin> {
        self.state
            .lock()
            .map(|state| state.active.utxo.coins_owned_by(owner))
            .unwrap_or_default()
    }

    /// Compact target for the child of `parent`
    pub fn next_bits(&self, parent: &BlockHeader, proof: ProofKind) -> u32 {
        self.target_policy.next_bits(&self.params, parent, proof)
    }

    // ==================== TRANSACTIONS ====================

    /// Fee `tx` would pay in the next block, or why it cannot be included
    pub fn check_transaction(&self, tx: &Transaction) -> ConsensusResult<Amount> {
        let state = self.lock()?;
        let ctx = self.tip_context(&state)?;
        rules::check_transaction(tx, &state.active.utxo, &ctx.as_context(&self.params, &state.tip.hash))
            .map_err(ConsensusError::Rejected)
    }

    /// Validate `tx` against the best chain and add it to the pool
    pub fn submit_transaction(&self, tx: Transaction) -> ConsensusResult<Hash> {
        let mut state = self.lock()?;
        let tip_ctx = self.tip_context(&state)?;
        rules::check_transaction(&tx, &state.active.utxo, &tip_ctx.as_context(&self.params, &state.tip.hash))
            .map_err(ConsensusError::Rejected)?;
        let txid = state.mempool.add(tx, self.clock.now())?;
        debug!("Pooled transaction {}", txid);
        Ok(txid)
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().map(|state| state.mempool.len()).unwrap_or(0)
    }

    /// Pooled transactions that are valid on the current tip, skipping any that
    /// spend `reserved`
    pub fn block_template(&self, max: usize, reserved: Option<&OutPoint>) -> ConsensusResult<BlockTemplate> {
        let state = self.lock()?;
        let tip_ctx = self.tip_context(&state)?;
        let ctx = tip_ctx.as_context(&self.params, &state.tip.hash);

        let mut template = BlockTemplate::default();
        for tx in state.mempool.get_pending(max) {
            if reserved.is_some_and(|r| tx.inputs.iter().any(|input| input.prevout == *r)) {
                continue;
            }
            match rules::check_transaction(&tx, &state.active.utxo, &ctx) {
                Ok(fee) => {
                    template.fees = template.fees.checked_add(fee).unwrap_or(template.fees);
                    template.transactions.push(tx);
                }
                Err(reason) => debug!("Leaving {} out of the block: {}", tx.txid(), reason),
            }
        }
        Ok(template)
    }

    fn tip_context(&self, state: &ChainState) -> ConsensusResult<TipContext> {
        let header = state
            .index
            .get(&state.tip.hash)
            .map(|entry| entry.header.clone())
            .ok_or(BlockchainError::BlockNotFound(state.tip.hash))?;
        Ok(TipContext {
            now: self.clock.now(),
            header,
        })
    }
}

/// Owned pieces of a `BlockContext` for a block on top of the tip
struct TipContext {
    now: Timestamp,
    header: BlockHeader,
}

impl TipContext {
    fn as_context<'a>(&'a self, params: &'a ConsensusParameters, tip_hash: &'a Hash) -> BlockContext<'a> {
        BlockContext {
            params,
            parent: &self.header,
            parent_hash: tip_hash,
            now: self.now,
            expected_bits: self.header.bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use blockchain_core::{TxIn, TxOut};
    use blockchain_crypto::KeyPair;
    use storage::MemoryStore;

    struct Harness {
        engine: ChainEngine,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        miner: KeyPair,
    }

    fn harness_with(params: ConsensusParameters) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(params.genesis_timestamp + 1_000));
        let engine = ChainEngine::open_with(
            Arc::new(params),
            store.clone(),
            clock.clone(),
            Arc::new(FixedTarget),
        )
        .unwrap();
        Harness { engine, store, clock, miner: KeyPair::generate() }
    }

    fn harness() -> Harness {
        harness_with(ConsensusParameters::regtest())
    }

    /// Mined work block on `parent` paying the full reward to the miner
    fn work_block(h: &Harness, parent: &BlockHeader, salt: u64, extra: Vec<Transaction>) -> Block {
        let height = parent.height + 1;
        let reward = h.engine.params().pow_reward(height);
        let coinbase = Transaction::coinbase(height, vec![TxOut::new(reward, h.miner.address())], salt);
        let mut transactions = vec![coinbase];
        transactions.extend(extra);
        let mut block = Block::new(
            parent.hash(),
            height,
            parent.timestamp + 1,
            h.engine.params().pow_limit_bits,
            ProofKind::Work,
            transactions,
        );
        while rules::check_proof_of_work(&block).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    fn extend(h: &Harness, count: usize) -> Vec<Block> {
        let mut blocks = Vec::new();
        for _ in 0..count {
            let tip = h.engine.header(&h.engine.tip().hash).unwrap();
            let block = work_block(h, &tip, 0, vec![]);
            assert!(h.engine.submit_block(block.clone()).unwrap().is_accepted());
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn test_open_initializes_genesis() {
        let h = harness();
        let tip = h.engine.tip();
        assert_eq!(tip.height, 0);
        assert_eq!(tip.hash, Block::genesis(h.engine.params()).hash());
        assert_eq!(h.store.best_tip().unwrap().unwrap().hash, tip.hash);
    }

    #[test]
    fn test_extend_tip() {
        let h = harness();
        let blocks = extend(&h, 3);
        let tip = h.engine.tip();
        assert_eq!(tip.height, 3);
        assert_eq!(tip.hash, blocks[2].hash());
        assert_eq!(h.engine.block_at_height(2).unwrap().unwrap().hash(), blocks[1].hash());
        assert_eq!(h.engine.coins_owned_by(&h.miner.address()).len(), 3);
    }

    #[test]
    fn test_resubmit_is_idempotent() {
        let h = harness();
        let block = extend(&h, 1).remove(0);
        let writes = h.store.block_writes();
        let tip = h.engine.tip();

        match h.engine.submit_block(block).unwrap() {
            BlockVerdict::Accepted(accepted) => {
                assert!(accepted.already_known);
                assert!(!accepted.became_tip);
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        assert_eq!(h.store.block_writes(), writes);
        assert_eq!(h.engine.tip(), tip);
    }

    #[test]
    fn test_pow_too_high() {
        let mut params = ConsensusParameters::regtest();
        params.last_pow_block_height = 1;
        let h = harness_with(params);
        extend(&h, 1);

        let tip = h.engine.header(&h.engine.tip().hash).unwrap();
        let block = work_block(&h, &tip, 0, vec![]);
        let verdict = h.engine.submit_block(block).unwrap();
        assert_eq!(verdict.reject_reason().unwrap().as_str(), rules::POW_TOO_HIGH);
        assert_eq!(h.engine.tip().height, 1);
    }

    #[test]
    fn test_unknown_parent_not_cached() {
        let h = harness();
        let genesis = h.engine.header(&h.engine.tip().hash).unwrap();
        let first = work_block(&h, &genesis, 0, vec![]);
        let second = work_block(&h, &first.header, 0, vec![]);

        let verdict = h.engine.submit_block(second.clone()).unwrap();
        assert_eq!(verdict.reject_reason().unwrap().as_str(), PREV_NOT_FOUND);

        assert!(h.engine.submit_block(first).unwrap().is_accepted());
        assert!(h.engine.submit_block(second).unwrap().is_accepted());
        assert_eq!(h.engine.tip().height, 2);
    }

    #[test]
    fn test_invalid_block_cached() {
        let h = harness();
        let genesis = h.engine.header(&h.engine.tip().hash).unwrap();
        let mut block = work_block(&h, &genesis, 0, vec![]);
        block.transactions[0].outputs[0].value = Amount::from_coins(1_000);
        block.header.transactions_root = Block::compute_root(&block.transactions);
        while rules::check_proof_of_work(&block).is_err() {
            block.header.nonce += 1;
        }

        let first = h.engine.submit_block(block.clone()).unwrap();
        let second = h.engine.submit_block(block).unwrap();
        assert!(!first.is_accepted());
        assert_eq!(first, second);
        assert_eq!(h.store.block_writes(), 1);
    }

    #[test]
    fn test_heavier_branch_reorganizes() {
        let h = harness();
        let main = extend(&h, 2);
        let mut rx = h.engine.subscribe_tip();
        rx.borrow_and_update();

        let genesis = Block::genesis(h.engine.params());
        let b1 = work_block(&h, &genesis.header, 7, vec![]);
        let b2 = work_block(&h, &b1.header, 7, vec![]);
        let b3 = work_block(&h, &b2.header, 7, vec![]);

        // Equal or lower work stays on the side.
        for block in [&b1, &b2] {
            match h.engine.submit_block(block.clone()).unwrap() {
                BlockVerdict::Accepted(a) => assert!(!a.became_tip),
                other => panic!("unexpected verdict {:?}", other),
            }
        }
        assert_eq!(h.engine.tip().hash, main[1].hash());

        match h.engine.submit_block(b3.clone()).unwrap() {
            BlockVerdict::Accepted(a) => {
                assert!(a.became_tip);
                assert_eq!(a.disconnected, 2);
            }
            other => panic!("unexpected verdict {:?}", other),
        }

        // One published change, straight to the new tip
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().hash, b3.hash());
        assert_eq!(h.engine.block_at_height(1).unwrap().unwrap().hash(), b1.hash());
        assert_eq!(h.store.hash_at_height(3).unwrap(), Some(b3.hash()));
        // Old branch coinbases are gone from the coin set.
        let main_coin = OutPoint::new(main[0].transactions[0].txid(), 0);
        assert!(h.engine.coin(&main_coin).is_none());
    }

    #[test]
    fn test_failed_reorg_keeps_tip() {
        let h = harness();
        extend(&h, 2);
        let tip = h.engine.tip();

        let genesis = Block::genesis(h.engine.params());
        let b1 = work_block(&h, &genesis.header, 9, vec![]);
        // Spends a coin that does not exist; only detectable once connected.
        let bogus = Transaction::new(
            vec![TxIn::spend(OutPoint::new(Hash::of(&"nothing"), 0))],
            vec![TxOut::new(Amount::from_coins(1), h.miner.address())],
            5,
        );
        let b2 = work_block(&h, &b1.header, 9, vec![bogus]);
        let b3 = work_block(&h, &b2.header, 9, vec![]);

        h.engine.submit_block(b1).unwrap();
        h.engine.submit_block(b2.clone()).unwrap();
        let verdict = h.engine.submit_block(b3.clone()).unwrap();

        assert!(!verdict.is_accepted());
        assert_eq!(h.engine.tip(), tip);
        // Both the bad block and its descendant are remembered as invalid.
        assert!(!h.engine.submit_block(b2).unwrap().is_accepted());
        assert!(!h.engine.submit_block(b3).unwrap().is_accepted());
    }

    #[test]
    fn test_storage_failure_halts() {
        let h = harness();
        h.store.set_fail_writes(true);
        let genesis = h.engine.header(&h.engine.tip().hash).unwrap();
        let block = work_block(&h, &genesis, 0, vec![]);

        assert!(matches!(h.engine.submit_block(block.clone()), Err(ConsensusError::Storage(_))));
        assert_eq!(h.engine.tip().height, 0);
        assert!(h.engine.is_halted());

        h.store.set_fail_writes(false);
        assert!(matches!(h.engine.submit_block(block), Err(ConsensusError::Halted)));
    }

    #[test]
    fn test_stale_tip_detected() {
        let h = harness();
        let genesis = h.engine.tip().hash;
        extend(&h, 1);
        let tip = h.engine.header(&h.engine.tip().hash).unwrap();
        let block = work_block(&h, &tip, 0, vec![]);

        assert!(matches!(
            h.engine.submit_if_tip(block.clone(), &genesis),
            Err(ConsensusError::StaleTip { .. })
        ));
        let current = h.engine.tip().hash;
        assert!(h.engine.submit_if_tip(block, &current).unwrap().is_accepted());
    }

    #[test]
    fn test_future_block_rejected() {
        let h = harness();
        let genesis = h.engine.header(&h.engine.tip().hash).unwrap();
        let mut block = work_block(&h, &genesis, 0, vec![]);
        block.header.timestamp = h.clock.now() + h.engine.params().max_future_block_time + 10;
        while rules::check_proof_of_work(&block).is_err() {
            block.header.nonce += 1;
        }
        match h.engine.submit_block(block.clone()).unwrap() {
            BlockVerdict::Rejected(reason) => assert_eq!(reason.as_str(), rules::TIMESTAMP_TOO_NEW),
            other => panic!("unexpected verdict {:?}", other),
        }

        // Once the clock catches up the same block and its child connect.
        h.clock.advance(60);
        assert!(h.engine.submit_block(block.clone()).unwrap().is_accepted());
        let child = work_block(&h, &block.header, 0, vec![]);
        assert!(h.engine.submit_block(child.clone()).unwrap().is_accepted());
        assert_eq!(h.engine.tip().hash, child.hash());
    }

    #[test]
    fn test_reopen_replays_chain() {
        let h = harness();
        let blocks = extend(&h, 4);
        let reopened = ChainEngine::open_with(
            h.engine.params().clone(),
            h.store.clone(),
            h.clock.clone(),
            Arc::new(FixedTarget),
        )
        .unwrap();
        assert_eq!(reopened.tip(), h.engine.tip());
        assert_eq!(reopened.tip().hash, blocks[3].hash());
        assert_eq!(reopened.coins_owned_by(&h.miner.address()).len(), 4);
    }

    #[test]
    fn test_reopen_other_network_fails() {
        let h = harness();
        let other = ChainEngine::open(Arc::new(ConsensusParameters::main()), h.store.clone());
        assert!(matches!(other, Err(ConsensusError::Config(_))));
    }

    #[test]
    fn test_locator_and_blocks_after() {
        let h = harness();
        let blocks = extend(&h, 30);
        let locator = h.engine.locator().unwrap();
        assert_eq!(locator[0], blocks[29].hash());
        assert_eq!(*locator.last().unwrap(), Block::genesis(h.engine.params()).hash());
        assert!(locator.len() < 30);

        let after = h.engine.blocks_after(&[blocks[9].hash()], 5).unwrap();
        let heights: Vec<u64> = after.iter().map(|b| b.height()).collect();
        assert_eq!(heights, vec![11, 12, 13, 14, 15]);

        let from_unknown = h.engine.blocks_after(&[Hash::of(&"elsewhere")], 2).unwrap();
        assert_eq!(from_unknown[0].height(), 1);
    }

    #[test]
    fn test_mempool_transactions_are_mined_and_removed() {
        let h = harness();
        let blocks = extend(&h, 12);
        let spendable = OutPoint::new(blocks[0].transactions[0].txid(), 0);
        let value = h.engine.coin(&spendable).unwrap().value();

        let tx = Transaction::new(
            vec![TxIn::spend(spendable)],
            vec![TxOut::new(value.saturating_sub(Amount::new(1_000)), h.miner.address())],
            10,
        );
        assert_eq!(h.engine.check_transaction(&tx).unwrap(), Amount::new(1_000));
        h.engine.submit_transaction(tx.clone()).unwrap();

        let template = h.engine.block_template(10, None).unwrap();
        assert_eq!(template.transactions.len(), 1);
        assert_eq!(template.fees, Amount::new(1_000));
        assert!(h.engine.block_template(10, Some(&spendable)).unwrap().transactions.is_empty());

        let tip = h.engine.header(&h.engine.tip().hash).unwrap();
        let block = work_block(&h, &tip, 0, vec![tx]);
        assert!(h.engine.submit_block(block).unwrap().is_accepted());
        assert_eq!(h.engine.mempool_len(), 0);
    }

    #[test]
    fn test_immature_spend_rejected_from_pool() {
        let h = harness();
        let blocks = extend(&h, 3);
        let young = OutPoint::new(blocks[2].transactions[0].txid(), 0);
        let tx = Transaction::new(
            vec![TxIn::spend(young)],
            vec![TxOut::new(Amount::from_coins(1), h.miner.address())],
            10,
        );
        match h.engine.check_transaction(&tx) {
            Err(ConsensusError::Rejected(reason)) => {
                assert_eq!(reason.as_str(), rules::IMMATURE_COINBASE_SPEND)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
