// wallet/src/lib.rs

//! Staking wallet
//!
//! Named wallets each hold one Ed25519 key behind a password, the unspent
//! coins paying to its address and a history of received transactions. The
//! manager follows the chain as a `ChainObserver` and serves the minter as a
//! `StakingWallet`. Keys can be kept across restarts in encrypted keystore
//! files; coins are rebuilt by rescanning the chain.

pub mod keystore;
pub mod manager;

pub use consensus::WalletError;
pub use keystore::{keystore_path, Keystore};
pub use manager::{HistoryEntry, WalletManager};

/// Result type for wallet operations
pub type WalletResult<T> = Result<T, WalletError>;
