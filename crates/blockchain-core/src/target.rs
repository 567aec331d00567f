// blockchain-core/src/target.rs

//! Compact difficulty targets and cumulative chain work.

use blockchain_crypto::Hash;
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// Expand compact `bits` into a full target. Negative or overflowing
/// encodings yield `None`.
pub fn compact_to_target(bits: u32) -> Option<BigUint> {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;

    if word != 0 && bits & 0x0080_0000 != 0 {
        return None;
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return None;
    }

    let target = if size <= 3 {
        BigUint::from(word >> (8 * (3 - size)))
    } else {
        BigUint::from(word) << (8 * (size - 3) as usize)
    };
    Some(target)
}

/// Compress a target into its compact representation
pub fn target_to_compact(target: &BigUint) -> u32 {
    let mut size = ((target.bits() + 7) / 8) as u32;
    let mut compact = if size <= 3 {
        target.to_u32().unwrap_or(0) << (8 * (3 - size))
    } else {
        (target >> (8 * (size - 3) as usize)).to_u32().unwrap_or(0)
    };

    // The sign bit must stay clear.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Interpret a hash as a 256-bit big-endian integer
pub fn hash_to_uint(hash: &Hash) -> BigUint {
    BigUint::from_bytes_be(hash.as_bytes())
}

/// Does `hash` satisfy the target encoded in `bits`?
pub fn meets_target(hash: &Hash, bits: u32) -> bool {
    match compact_to_target(bits) {
        Some(target) if !target.is_zero() => hash_to_uint(hash) <= target,
        _ => false,
    }
}

/// Expected number of hashes to meet `bits`: `2^256 / (target + 1)`
pub fn block_work(bits: u32) -> BigUint {
    match compact_to_target(bits) {
        Some(target) if !target.is_zero() => (BigUint::one() << 256usize) / (target + 1u32),
        _ => BigUint::zero(),
    }
}

/// Cumulative work of a chain, the weight compared during tip selection
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainWork(BigUint);

impl ChainWork {
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(block_work(bits))
    }

    pub fn inner(&self) -> &BigUint {
        &self.0
    }
}

impl Add<&ChainWork> for &ChainWork {
    type Output = ChainWork;

    fn add(self, other: &ChainWork) -> ChainWork {
        ChainWork(&self.0 + &other.0)
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
