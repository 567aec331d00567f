// blockchain-core/src/transaction.rs

use crate::{types::*, BlockchainError, BlockchainResult};
use blockchain_crypto::{Address, Hash};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Reference to a transaction output
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// Outpoint referenced by a coinbase input
    pub fn null() -> Self {
        Self { txid: Hash::zero(), vout: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }
}

impl fmt::Debug for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid.to_hex(), self.vout)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid.to_hex(), self.vout)
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    /// Arbitrary data; coinbase inputs carry the block height here
    pub data: Vec<u8>,
}

impl TxIn {
    pub fn spend(prevout: OutPoint) -> Self {
        Self { prevout, data: Vec::new() }
    }
}

/// Transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    pub owner: Address,
}

impl TxOut {
    pub fn new(value: Amount, owner: Address) -> Self {
        Self { value, owner }
    }

    /// The marker output that opens every coinstake
    pub fn empty() -> Self {
        Self { value: Amount::zero(), owner: Address::zero() }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_zero() && self.owner.is_zero()
    }
}

/// UTXO transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub timestamp: Timestamp,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>, timestamp: Timestamp) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            timestamp,
            inputs,
            outputs,
        }
    }

    /// Reward transaction of a proof-of-work block
    pub fn coinbase(height: BlockNumber, outputs: Vec<TxOut>, timestamp: Timestamp) -> Self {
        let input = TxIn {
            prevout: OutPoint::null(),
            data: height.to_le_bytes().to_vec(),
        };
        Self::new(vec![input], outputs, timestamp)
    }

    /// Reward transaction of a proof-of-stake block: spends the staked coin and
    /// pays it back, plus the reward, behind the empty marker output.
    pub fn coinstake(prevout: OutPoint, payouts: Vec<TxOut>, timestamp: Timestamp) -> Self {
        let mut outputs = Vec::with_capacity(payouts.len() + 1);
        outputs.push(TxOut::empty());
        outputs.extend(payouts);
        Self::new(vec![TxIn::spend(prevout)], outputs, timestamp)
    }

    /// Transaction id
    pub fn txid(&self) -> Hash {
        Hash::of(self)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].prevout.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(Amount::zero(), |acc, out| acc.checked_add(out.value))
    }

    /// Context-free checks
    pub fn validate_basic(&self) -> BlockchainResult<()> {
        if self.inputs.is_empty() {
            return Err(BlockchainError::InvalidTransaction("no inputs".into()));
        }
        if self.outputs.is_empty() {
            return Err(BlockchainError::InvalidTransaction("no outputs".into()));
        }
        if self.total_output().is_none() {
            return Err(BlockchainError::InvalidTransaction("output total overflows".into()));
        }

        if self.is_coinbase() {
            return Ok(());
        }

        let mut seen = HashSet::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if input.prevout.is_null() {
                return Err(BlockchainError::InvalidTransaction(
                    "null prevout outside coinbase".into()
                ));
            }
            if !seen.insert(input.prevout) {
                return Err(BlockchainError::InvalidTransaction(
                    format!("duplicate input {}", input.prevout)
                ));
            }
        }

        // Only the coinstake marker may be an empty output.
        let first_payable = if self.is_coinstake() { 1 } else { 0 };
        if self.outputs[first_payable..].iter().any(|out| out.value.is_zero()) {
            return Err(BlockchainError::InvalidTransaction("zero-value output".into()));
        }

        Ok(())
    }
}
