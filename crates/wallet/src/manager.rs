// wallet/src/manager.rs

use crate::keystore::{derive_key, keystore_path, random_salt, Keystore, SALT_LEN};
use crate::WalletResult;
use blockchain_core::{Amount, Block, BlockNumber, Coin, OutPoint, Timestamp, Transaction};
use blockchain_crypto::{Address, Hash, KeyPair};
use consensus::{ChainObserver, StakingKey, StakingWallet, WalletError, WalletSecret};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

/// A transaction that paid the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub txid: Hash,
    /// Total of the outputs paying the wallet
    pub amount: Amount,
    pub height: BlockNumber,
    pub is_coinstake: bool,
}

struct WalletRecord {
    keypair: KeyPair,
    salt: [u8; SALT_LEN],
    digest: [u8; 32],
    coins: BTreeMap<OutPoint, Coin>,
    history: Vec<HistoryEntry>,
    /// Coins spent by each recorded transaction, restored if it is disconnected
    spent_by: HashMap<Hash, Vec<Coin>>,
}

impl WalletRecord {
    fn address(&self) -> Address {
        self.keypair.address()
    }

    fn knows(&self, txid: &Hash) -> bool {
        self.spent_by.contains_key(txid)
    }

    /// Apply `tx` once; returns whether it touched the wallet
    fn apply(&mut self, tx: &Transaction, height: BlockNumber, block_time: Timestamp) -> bool {
        let txid = tx.txid();
        if self.knows(&txid) {
            return false;
        }

        let spent: Vec<Coin> = tx
            .inputs
            .iter()
            .filter_map(|input| self.coins.remove(&input.prevout))
            .collect();

        let address = self.address();
        let received: Vec<Coin> = Coin::from_transaction(tx, height, block_time)
            .into_iter()
            .filter(|coin| coin.owner() == address)
            .collect();

        if spent.is_empty() && received.is_empty() {
            return false;
        }

        if !received.is_empty() {
            let amount = received
                .iter()
                .fold(Amount::zero(), |sum, coin| sum.checked_add(coin.value()).unwrap_or(sum));
            self.history.push(HistoryEntry {
                txid,
                amount,
                height,
                is_coinstake: tx.is_coinstake(),
            });
        }
        for coin in received {
            self.coins.insert(coin.outpoint, coin);
        }
        self.spent_by.insert(txid, spent);
        true
    }

    fn revert(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        let Some(spent) = self.spent_by.remove(&txid) else {
            return;
        };
        self.coins.retain(|outpoint, _| outpoint.txid != txid);
        for coin in spent {
            self.coins.insert(coin.outpoint, coin);
        }
        self.history.retain(|entry| entry.txid != txid);
    }

    fn check_password(&self, password: &str) -> WalletResult<bool> {
        let digest = derive_key(password, &self.salt)?;
        Ok(digest[..].ct_eq(&self.digest[..]).into())
    }
}

/// Named wallets kept in memory
#[derive(Default)]
pub struct WalletManager {
    wallets: RwLock<HashMap<String, WalletRecord>>,
}

impl WalletManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a wallet with a fresh key
    pub fn create_wallet(&self, name: &str, password: &str) -> WalletResult<Address> {
        self.import_wallet(name, password, KeyPair::generate())
    }

    /// Create a wallet around an existing key
    pub fn import_wallet(&self, name: &str, password: &str, keypair: KeyPair) -> WalletResult<Address> {
        let mut wallets = self.write();
        if wallets.contains_key(name) {
            return Err(WalletError::AlreadyExists(name.to_string()));
        }

        let salt = random_salt();
        let record = WalletRecord {
            digest: *derive_key(password, &salt)?,
            salt,
            keypair,
            coins: BTreeMap::new(),
            history: Vec::new(),
            spent_by: HashMap::new(),
        };
        let address = record.address();
        wallets.insert(name.to_string(), record);

        info!("Created wallet '{}' with address {}", name, address);
        Ok(address)
    }

    /// Load wallet `name` from its keystore under `dir`, or create the
    /// keystore with a fresh key when there is none
    pub fn open_or_create(&self, dir: &Path, name: &str, password: &str) -> WalletResult<Address> {
        let path = keystore_path(dir, name);
        let keypair = if path.exists() {
            let keypair = Keystore::load(&path)?.open(name, password)?;
            info!("Loaded keystore for wallet '{}'", name);
            keypair
        } else {
            let keypair = KeyPair::generate();
            Keystore::seal(&keypair, password)?.save(&path)?;
            keypair
        };
        self.import_wallet(name, password, keypair)
    }

    /// Replay `blocks`, oldest first, into wallet `name`. Transactions the
    /// wallet already recorded are skipped. Returns how many were applied.
    pub fn rescan<'a>(&self, name: &str, blocks: impl IntoIterator<Item = &'a Block>) -> WalletResult<usize> {
        let mut wallets = self.write();
        let record = wallets
            .get_mut(name)
            .ok_or_else(|| WalletError::NotFound(name.to_string()))?;
        let mut applied = 0;
        for block in blocks {
            for tx in &block.transactions {
                if record.apply(tx, block.height(), block.header.timestamp) {
                    applied += 1;
                }
            }
        }
        info!("Rescanned wallet '{}', {} transactions applied", name, applied);
        Ok(applied)
    }

    pub fn remove_wallet(&self, name: &str) -> WalletResult<()> {
        self.write()
            .remove(name)
            .map(|_| info!("Removed wallet '{}'", name))
            .ok_or_else(|| WalletError::NotFound(name.to_string()))
    }

    pub fn wallet_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn address(&self, name: &str) -> WalletResult<Address> {
        self.with_wallet(name, |record| record.address())
    }

    pub fn balance(&self, name: &str) -> WalletResult<Amount> {
        self.with_wallet(name, |record| {
            record
                .coins
                .values()
                .fold(Amount::zero(), |sum, coin| sum.checked_add(coin.value()).unwrap_or(sum))
        })
    }

    /// Received transactions, oldest first
    pub fn transactions(&self, name: &str) -> WalletResult<Vec<HistoryEntry>> {
        self.with_wallet(name, |record| record.history.clone())
    }

    fn with_wallet<T>(&self, name: &str, f: impl FnOnce(&WalletRecord) -> T) -> WalletResult<T> {
        self.read()
            .get(name)
            .map(f)
            .ok_or_else(|| WalletError::NotFound(name.to_string()))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, WalletRecord>> {
        self.wallets.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, WalletRecord>> {
        self.wallets.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl StakingWallet for WalletManager {
    fn unlock(&self, secret: &WalletSecret) -> Result<StakingKey, WalletError> {
        let wallets = self.read();
        let record = wallets
            .get(&secret.name)
            .ok_or_else(|| WalletError::NotFound(secret.name.clone()))?;
        if !record.check_password(&secret.password)? {
            return Err(WalletError::Auth(secret.name.clone()));
        }
        Ok(StakingKey::new(secret.name.clone(), record.keypair.clone()))
    }

    fn spendable_coins(&self, wallet: &str) -> Result<Vec<Coin>, WalletError> {
        self.with_wallet(wallet, |record| record.coins.values().cloned().collect())
    }

    fn record_transaction(&self, wallet: &str, tx: &Transaction, height: BlockNumber) -> Result<(), WalletError> {
        let mut wallets = self.write();
        let record = wallets
            .get_mut(wallet)
            .ok_or_else(|| WalletError::NotFound(wallet.to_string()))?;
        if record.apply(tx, height, tx.timestamp) {
            debug!("Wallet '{}' recorded {}", wallet, tx.txid());
        }
        Ok(())
    }
}

impl ChainObserver for WalletManager {
    fn block_connected(&self, block: &Block) {
        let mut wallets = self.write();
        for (name, record) in wallets.iter_mut() {
            for tx in &block.transactions {
                if record.apply(tx, block.height(), block.header.timestamp) {
                    debug!("Wallet '{}' saw {} in block #{}", name, tx.txid(), block.height());
                }
            }
        }
    }

    fn block_disconnected(&self, block: &Block) {
        let mut wallets = self.write();
        for record in wallets.values_mut() {
            for tx in block.transactions.iter().rev() {
                record.revert(tx);
            }
        }
    }
}
