// consensus/src/lib.rs

//! Hybrid proof-of-work / proof-of-stake consensus
//!
//! This crate provides:
//! - Block validation rules and the chain engine that owns the tip
//! - Coin maturity tracking and stake candidate selection
//! - Stake kernel search and the staking state machine
//! - A proof-of-work miner for the initial distribution phase

pub mod clock;
pub mod engine;
pub mod interfaces;
pub mod kernel;
pub mod maturity;
pub mod minter;
pub mod pow;
pub mod rules;
pub mod selection;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{AcceptedBlock, BlockTemplate, BlockVerdict, ChainEngine, ChainTip};
pub use interfaces::{BlockRelay, ChainObserver, PeerId, StakingKey, StakingWallet, WalletError, WalletSecret};
pub use kernel::{FixedTarget, TargetPolicy};
pub use maturity::{CoinMaturityTracker, Maturity};
pub use minter::{MinterConfig, MinterEvent, MinterState, StakeMinter};
pub use pow::PowMiner;
pub use rules::RejectReason;
pub use selection::{CandidateOrdering, LargestFirst, OldestFirst, StakeCandidateSelector};

use blockchain_core::BlockchainError;
use blockchain_crypto::{CryptoError, Hash};
use storage::StorageError;

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Errors that can occur during consensus operations
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Block rejected: {0}")]
    Rejected(RejectReason),

    #[error("Tip moved: expected {expected}, found {actual}")]
    StaleTip { expected: Hash, actual: Hash },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Chain engine halted after a storage failure")]
    Halted,

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}
