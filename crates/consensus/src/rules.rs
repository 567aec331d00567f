// consensus/src/rules.rs

//! Block validity rules.
//!
//! Everything here is a pure function of the block, its parent and a coin
//! view; the engine decides when each check runs.

use crate::maturity::is_mature;
use crate::kernel::{kernel_hash, kernel_meets_target};
use blockchain_core::{
    target::meets_target, Amount, Block, BlockHeader, Coin, ConsensusParameters, OutPoint,
    ProofKind, Timestamp, Transaction, UtxoSet,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

pub const POW_TOO_HIGH: &str = "proof of work too high";
pub const PREV_NOT_FOUND: &str = "previous block not found";
pub const IMMATURE_COINBASE_SPEND: &str = "tried to spend coinbase before maturity";
pub const TIMESTAMP_TOO_NEW: &str = "timestamp too far in the future";

/// Why a block was refused; carried as a value, never fatal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RejectReason(String);

impl RejectReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rejections that depend on what the node knows rather than on the block
    /// itself, and so are not remembered
    pub fn is_transient(&self) -> bool {
        self.0 == PREV_NOT_FOUND || self.0 == TIMESTAMP_TOO_NEW
    }

    /// The block's parent is not known yet
    pub fn is_orphan(&self) -> bool {
        self.0 == PREV_NOT_FOUND
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RejectReason {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

pub type RuleResult<T> = Result<T, RejectReason>;

fn reject<T>(reason: impl Into<String>) -> RuleResult<T> {
    Err(RejectReason::new(reason))
}

/// Chain position a block is validated against
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub params: &'a ConsensusParameters,
    pub parent: &'a BlockHeader,
    pub parent_hash: &'a blockchain_crypto::Hash,
    pub now: Timestamp,
    pub expected_bits: u32,
}

/// Proof-of-work blocks are refused after the switchover, whatever else they contain
pub fn check_pow_cutoff(header: &BlockHeader, params: &ConsensusParameters) -> RuleResult<()> {
    if header.proof == ProofKind::Work && !params.pow_allowed(header.height) {
        return reject(POW_TOO_HIGH);
    }
    Ok(())
}

/// Header fields against the parent and the local clock
pub fn check_header(block: &Block, ctx: &BlockContext<'_>) -> RuleResult<()> {
    let header = &block.header;

    if header.parent_hash != *ctx.parent_hash {
        return reject("parent hash mismatch");
    }
    if header.height != ctx.parent.height + 1 {
        return reject(format!("bad height {}, expected {}", header.height, ctx.parent.height + 1));
    }
    if header.timestamp <= ctx.parent.timestamp {
        return reject("timestamp not after parent");
    }
    if header.timestamp > ctx.now + ctx.params.max_future_block_time {
        return reject(TIMESTAMP_TOO_NEW);
    }
    if header.bits != ctx.expected_bits {
        return reject("incorrect difficulty bits");
    }
    if header.proof == ProofKind::Stake && !ctx.params.pos_allowed(header.height) {
        return reject("proof of stake not allowed at this height");
    }
    Ok(())
}

/// Transaction layout and the Merkle commitment
pub fn check_structure(block: &Block) -> RuleResult<()> {
    let Some(first) = block.transactions.first() else {
        return reject("block has no transactions");
    };
    if block.header.transactions_root != Block::compute_root(&block.transactions) {
        return reject("transactions root mismatch");
    }

    match block.header.proof {
        ProofKind::Work => {
            if !first.is_coinbase() {
                return reject("first transaction is not coinbase");
            }
            if block.signature.is_some() {
                return reject("proof-of-work block carries a signature");
            }
        }
        ProofKind::Stake => {
            if !first.is_coinstake() {
                return reject("first transaction is not coinstake");
            }
        }
    }

    if block.transactions[1..].iter().any(|tx| tx.is_coinbase() || tx.is_coinstake()) {
        return reject("misplaced reward transaction");
    }

    let mut seen = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        tx.validate_basic().map_err(|e| RejectReason::new(e.to_string()))?;
        if !seen.insert(tx.txid()) {
            return reject("duplicate transaction");
        }
    }

    Ok(())
}

/// Header hash against the work target
pub fn check_proof_of_work(block: &Block) -> RuleResult<()> {
    if !meets_target(&block.hash(), block.header.bits) {
        return reject("proof of work failed");
    }
    Ok(())
}

/// Input coins as seen by one block: the chain view plus earlier outputs of
/// the same block, minus what the block already spent.
struct BlockCoinView<'a> {
    utxo: &'a UtxoSet,
    created: HashMap<OutPoint, Coin>,
    spent: HashSet<OutPoint>,
}

impl<'a> BlockCoinView<'a> {
    fn new(utxo: &'a UtxoSet) -> Self {
        Self { utxo, created: HashMap::new(), spent: HashSet::new() }
    }

    fn spend(&mut self, outpoint: &OutPoint) -> RuleResult<Coin> {
        if !self.spent.insert(*outpoint) {
            return reject(format!("double spend of {}", outpoint));
        }
        self.created
            .get(outpoint)
            .or_else(|| self.utxo.get(outpoint))
            .cloned()
            .ok_or_else(|| RejectReason::new(format!("missing input {}", outpoint)))
    }

    fn add_outputs(&mut self, tx: &Transaction, height: u64, block_time: Timestamp) {
        for coin in Coin::from_transaction(tx, height, block_time) {
            self.created.insert(coin.outpoint, coin);
        }
    }
}

/// Reward coins may only be spent once `coinbase_maturity` deep below the parent
fn check_spend_maturity(coin: &Coin, ctx: &BlockContext<'_>) -> RuleResult<()> {
    if coin.kind.is_reward() && !is_mature(coin.height, ctx.parent.height, ctx.params.coinbase_maturity) {
        return reject(IMMATURE_COINBASE_SPEND);
    }
    Ok(())
}

/// Value of all inputs of `tx`, spending them in `view`
fn spend_inputs(tx: &Transaction, view: &mut BlockCoinView<'_>, ctx: &BlockContext<'_>) -> RuleResult<Amount> {
    let mut total = Amount::zero();
    for input in &tx.inputs {
        let coin = view.spend(&input.prevout)?;
        check_spend_maturity(&coin, ctx)?;
        total = total
            .checked_add(coin.value())
            .ok_or_else(|| RejectReason::new("input total overflows"))?;
    }
    Ok(total)
}

/// Fee of a single loose transaction against `utxo`, as the next block would see it
pub fn check_transaction(tx: &Transaction, utxo: &UtxoSet, ctx: &BlockContext<'_>) -> RuleResult<Amount> {
    if tx.is_coinbase() || tx.is_coinstake() {
        return reject("reward transaction outside a block");
    }
    tx.validate_basic().map_err(|e| RejectReason::new(e.to_string()))?;
    let mut view = BlockCoinView::new(utxo);
    let input = spend_inputs(tx, &mut view, ctx)?;
    let output = tx.total_output().ok_or_else(|| RejectReason::new("output total overflows"))?;
    input
        .checked_sub(output)
        .ok_or_else(|| RejectReason::new("inputs below outputs"))
}

/// Full contextual validation of a block whose structure already passed.
/// Returns the fees collected by the block.
pub fn check_block_contents(block: &Block, ctx: &BlockContext<'_>, utxo: &UtxoSet) -> RuleResult<Amount> {
    let height = block.header.height;
    let block_time = block.header.timestamp;
    let mut view = BlockCoinView::new(utxo);

    // The staked coin is checked before anything else may spend it.
    let stake = match block.header.proof {
        ProofKind::Stake => {
            let coinstake = &block.transactions[0];
            let staked = check_stake(block, coinstake, ctx, &mut view)?;
            view.add_outputs(coinstake, height, block_time);
            Some((coinstake, staked))
        }
        ProofKind::Work => None,
    };

    let mut fees = Amount::zero();
    for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase() && !tx.is_coinstake()) {
        let input = spend_inputs(tx, &mut view, ctx)?;
        let output = tx.total_output().ok_or_else(|| RejectReason::new("output total overflows"))?;
        let fee = input
            .checked_sub(output)
            .ok_or_else(|| RejectReason::new("inputs below outputs"))?;
        fees = fees.checked_add(fee).ok_or_else(|| RejectReason::new("fee total overflows"))?;
        view.add_outputs(tx, height, block_time);
    }

    match stake {
        Some((coinstake, staked_value)) => {
            let allowed = staked_value
                .checked_add(ctx.params.proof_of_stake_reward)
                .and_then(|v| v.checked_add(fees))
                .ok_or_else(|| RejectReason::new("stake reward overflows"))?;
            let paid = coinstake.total_output().ok_or_else(|| RejectReason::new("output total overflows"))?;
            if paid > allowed {
                return reject(format!("coinstake pays too much ({} > {})", paid, allowed));
            }
        }
        None => {
            let coinbase = &block.transactions[0];
            if coinbase.inputs[0].data != height.to_le_bytes() {
                return reject("coinbase height mismatch");
            }
            let allowed = ctx
                .params
                .pow_reward(height)
                .checked_add(fees)
                .ok_or_else(|| RejectReason::new("block reward overflows"))?;
            let paid = coinbase.total_output().ok_or_else(|| RejectReason::new("output total overflows"))?;
            if paid > allowed {
                return reject(format!("coinbase pays too much ({} > {})", paid, allowed));
            }
        }
    }

    Ok(fees)
}

/// Coinstake rules; spends the staked inputs in `view` and returns their value
fn check_stake(
    block: &Block,
    coinstake: &Transaction,
    ctx: &BlockContext<'_>,
    view: &mut BlockCoinView<'_>,
) -> RuleResult<Amount> {
    let header = &block.header;
    let params = ctx.params;

    if header.timestamp & params.stake_timestamp_mask != 0 {
        return reject("stake timestamp violates mask");
    }
    if coinstake.timestamp != header.timestamp {
        return reject("coinstake timestamp differs from block timestamp");
    }

    let kernel_outpoint = coinstake.inputs[0].prevout;
    let kernel_coin = view.spend(&kernel_outpoint)?;
    let stake_depth = if kernel_coin.kind.is_reward() {
        params.stake_min_confirmations.max(params.coinbase_maturity)
    } else {
        params.stake_min_confirmations
    };
    if !is_mature(kernel_coin.height, ctx.parent.height, stake_depth) {
        return reject("coinstake input not mature");
    }
    if kernel_coin.block_time > header.timestamp {
        return reject("stake coin newer than block");
    }

    let signer = block.verify_signature().map_err(|e| RejectReason::new(e.to_string()))?;
    if signer != kernel_coin.owner() {
        return reject("block not signed by the stake owner");
    }

    let hash = kernel_hash(ctx.parent_hash, ctx.parent.timestamp, &kernel_coin, header.timestamp);
    if !kernel_meets_target(&hash, header.bits, &kernel_coin) {
        return reject("stake kernel does not meet target");
    }

    let mut staked = kernel_coin.value();
    for input in &coinstake.inputs[1..] {
        let coin = view.spend(&input.prevout)?;
        check_spend_maturity(&coin, ctx)?;
        staked = staked
            .checked_add(coin.value())
            .ok_or_else(|| RejectReason::new("input total overflows"))?;
    }
    Ok(staked)
}
