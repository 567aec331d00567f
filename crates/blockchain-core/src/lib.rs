// blockchain-core/src/lib.rs

//! Core blockchain data structures and logic
//!
//! This crate provides:
//! - Amounts, UTXO transactions and coins
//! - Blocks with proof-of-work or proof-of-stake headers
//! - Compact targets and cumulative chain work
//! - Per-network consensus parameters
//! - The unspent coin set, fork resolution and the transaction pool

pub mod block;
pub mod coin;
pub mod fork;
pub mod mempool;
pub mod params;
pub mod target;
pub mod transaction;
pub mod types;
pub mod utxo;

pub use block::{Block, BlockHeader, BlockSignature, ProofKind};
pub use coin::{Coin, CoinKind};
pub use fork::{ForkResolver, ReorgPath, TreeLink};
pub use mempool::{PoolConfig, TransactionPool};
pub use params::{ConsensusParameters, Network};
pub use target::ChainWork;
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};
pub use types::*;
pub use utxo::{BlockUndo, UtxoSet};

use blockchain_crypto::Hash;

/// Result type for blockchain operations
pub type BlockchainResult<T> = Result<T, BlockchainError>;

/// Errors that can occur in blockchain operations
#[derive(Debug, thiserror::Error)]
pub enum BlockchainError {
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    #[error("Block not found: {0}")]
    BlockNotFound(Hash),

    #[error("Reorganization too deep: {depth} blocks")]
    ReorgTooDeep { depth: u64 },

    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(Hash),

    #[error("Transaction pool full")]
    PoolFull,

    #[error("Cryptographic error: {0}")]
    CryptoError(#[from] blockchain_crypto::CryptoError),
}
