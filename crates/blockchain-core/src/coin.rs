// blockchain-core/src/coin.rs

use crate::{transaction::{OutPoint, Transaction, TxOut}, Amount, BlockNumber, Timestamp};
use blockchain_crypto::Address;
use serde::{Deserialize, Serialize};

/// Where a coin came from; reward coins are subject to coinbase maturity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoinKind {
    Regular,
    Coinbase,
    Coinstake,
}

impl CoinKind {
    pub fn of(tx: &Transaction) -> Self {
        if tx.is_coinbase() {
            CoinKind::Coinbase
        } else if tx.is_coinstake() {
            CoinKind::Coinstake
        } else {
            CoinKind::Regular
        }
    }

    pub fn is_reward(&self) -> bool {
        matches!(self, CoinKind::Coinbase | CoinKind::Coinstake)
    }
}

/// A confirmed, unspent output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub output: TxOut,
    /// Height of the confirming block
    pub height: BlockNumber,
    /// Timestamp of the confirming block
    pub block_time: Timestamp,
    pub kind: CoinKind,
}

impl Coin {
    pub fn value(&self) -> Amount {
        self.output.value
    }

    pub fn owner(&self) -> Address {
        self.output.owner
    }

    /// All spendable outputs created by `tx`; the empty coinstake marker is skipped
    pub fn from_transaction(tx: &Transaction, height: BlockNumber, block_time: Timestamp) -> Vec<Coin> {
        let txid = tx.txid();
        let kind = CoinKind::of(tx);
        tx.outputs
            .iter()
            .enumerate()
            .filter(|(_, out)| !out.is_empty())
            .map(|(vout, out)| Coin {
                outpoint: OutPoint::new(txid, vout as u32),
                output: *out,
                height,
                block_time,
                kind,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockchain_crypto::{Hash, KeyPair};

    #[test]
    fn test_coins_from_coinstake_skip_marker() {
        let owner = KeyPair::generate().address();
        let prevout = OutPoint::new(Hash::of(&7u8), 0);
        let tx = Transaction::coinstake(prevout, vec![TxOut::new(Amount::from_coins(3), owner)], 50);

        let coins = Coin::from_transaction(&tx, 20, 50);
        assert_eq!(coins.len(), 1);
        assert_eq!(coins[0].outpoint.vout, 1);
        assert_eq!(coins[0].kind, CoinKind::Coinstake);
        assert_eq!(coins[0].owner(), owner);
    }

    #[test]
    fn test_coinbase_coins_are_rewards() {
        let owner = KeyPair::generate().address();
        let tx = Transaction::coinbase(3, vec![TxOut::new(Amount::from_coins(4), owner)], 50);
        let coins = Coin::from_transaction(&tx, 3, 50);
        assert!(coins[0].kind.is_reward());
        assert_eq!(coins[0].height, 3);
    }
}
