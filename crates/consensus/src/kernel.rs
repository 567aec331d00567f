// consensus/src/kernel.rs

//! Stake kernel hashing and difficulty targets

use blockchain_core::{
    target::{compact_to_target, hash_to_uint},
    BlockHeader, Coin, ConsensusParameters, OutPoint, ProofKind, Timestamp,
};
use blockchain_crypto::Hash;
use num_traits::Zero;
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct KernelInput<'a> {
    prev_hash: &'a Hash,
    prev_time: Timestamp,
    coin_time: Timestamp,
    outpoint: &'a OutPoint,
    time: Timestamp,
}

/// Double SHA-256 over the previous block, the staked coin and the candidate time
pub fn kernel_hash(prev_hash: &Hash, prev_time: Timestamp, coin: &Coin, time: Timestamp) -> Hash {
    Hash::of(&KernelInput {
        prev_hash,
        prev_time,
        coin_time: coin.block_time,
        outpoint: &coin.outpoint,
        time,
    })
}

/// Kernel succeeds when `hash <= target(bits) * value`
pub fn kernel_meets_target(hash: &Hash, bits: u32, coin: &Coin) -> bool {
    match compact_to_target(bits) {
        Some(target) if !target.is_zero() => {
            hash_to_uint(hash) <= target * coin.value().units()
        }
        _ => false,
    }
}

/// Compact target a block must carry
pub trait TargetPolicy: Send + Sync {
    fn next_bits(&self, params: &ConsensusParameters, parent: &BlockHeader, proof: ProofKind) -> u32;
}

/// Network limit for each proof type, no retargeting
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTarget;

impl TargetPolicy for FixedTarget {
    fn next_bits(&self, params: &ConsensusParameters, _parent: &BlockHeader, proof: ProofKind) -> u32 {
        match proof {
            ProofKind::Work => params.pow_limit_bits,
            ProofKind::Stake => params.pos_limit_bits,
        }
    }
}

/// Earliest timestamp after the parent that a stake block may use at `now`
pub fn stake_time(params: &ConsensusParameters, parent_time: Timestamp, now: Timestamp) -> Timestamp {
    let mask = params.stake_timestamp_mask;
    let earliest = now.max(parent_time + 1);
    (earliest + mask) & !mask
}

/// Everything the kernel depends on besides the coin
#[derive(Debug, Clone)]
pub struct KernelContext {
    pub prev_hash: Hash,
    pub prev_time: Timestamp,
    pub time: Timestamp,
    pub bits: u32,
}

#[derive(Debug, Clone)]
pub struct KernelHit {
    pub coin: Coin,
    pub hash: Hash,
}

/// Outcome of a bounded kernel search
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub hit: Option<KernelHit>,
    pub attempts: usize,
    /// Stopped on the deadline before trying every candidate
    pub timed_out: bool,
}

/// Try candidates in order until one meets the target or the deadline passes
pub fn search_kernel(ctx: &KernelContext, candidates: &[Coin], deadline: Instant) -> SearchOutcome {
    let mut attempts = 0;
    for coin in candidates {
        if Instant::now() >= deadline {
            return SearchOutcome { hit: None, attempts, timed_out: true };
        }
        attempts += 1;

        // The coin must predate the block it stakes.
        if coin.block_time > ctx.time {
            continue;
        }
        let hash = kernel_hash(&ctx.prev_hash, ctx.prev_time, coin, ctx.time);
        if kernel_meets_target(&hash, ctx.bits, coin) {
            return SearchOutcome {
                hit: Some(KernelHit { coin: coin.clone(), hash }),
                attempts,
                timed_out: false,
            };
        }
    }
    SearchOutcome { hit: None, attempts, timed_out: false }
}
