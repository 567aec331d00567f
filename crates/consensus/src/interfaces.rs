// consensus/src/interfaces.rs

//! Contracts the consensus core consumes from its collaborators

use blockchain_core::{Block, BlockNumber, Coin, Transaction};
use blockchain_crypto::{Address, Hash, KeyPair};
use std::fmt;
use zeroize::Zeroizing;

/// Wallet name and password supplied once when staking starts.
/// The password is wiped from memory when the value is dropped.
#[derive(Clone)]
pub struct WalletSecret {
    pub name: String,
    pub password: Zeroizing<String>,
}

impl WalletSecret {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: Zeroizing::new(password.into()),
        }
    }
}

impl fmt::Debug for WalletSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSecret")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Unlocked signing key for one staking session
pub struct StakingKey {
    wallet: String,
    keypair: KeyPair,
}

impl StakingKey {
    pub fn new(wallet: impl Into<String>, keypair: KeyPair) -> Self {
        Self { wallet: wallet.into(), keypair }
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}

impl fmt::Debug for StakingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StakingKey({}, {})", self.wallet, self.address())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("Authentication failed for wallet {0}")]
    Auth(String),

    #[error("Wallet not found: {0}")]
    NotFound(String),

    #[error("Wallet {0} is locked")]
    Locked(String),

    #[error("Wallet already exists: {0}")]
    AlreadyExists(String),

    #[error("Wallet error: {0}")]
    Other(String),
}

impl WalletError {
    /// Errors that end a staking session rather than a single round
    pub fn is_fatal(&self) -> bool {
        matches!(self, WalletError::Auth(_) | WalletError::NotFound(_))
    }
}

/// Wallet operations staking relies on
pub trait StakingWallet: Send + Sync {
    fn unlock(&self, secret: &WalletSecret) -> Result<StakingKey, WalletError>;

    /// Unspent coins the wallet can sign for
    fn spendable_coins(&self, wallet: &str) -> Result<Vec<Coin>, WalletError>;

    fn record_transaction(&self, wallet: &str, tx: &Transaction, height: BlockNumber) -> Result<(), WalletError>;
}

/// Notified by the engine, in order, after every committed tip change.
/// Implementations must not call back into the engine.
pub trait ChainObserver: Send + Sync {
    fn block_connected(&self, block: &Block);

    fn block_disconnected(&self, block: &Block);
}

pub type PeerId = u64;

/// Outbound block relay
pub trait BlockRelay: Send + Sync {
    fn broadcast_block(&self, block: &Block);

    fn peer_tip(&self, peer: PeerId) -> Option<Hash>;
}
