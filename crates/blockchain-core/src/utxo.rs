// blockchain-core/src/utxo.rs

use crate::{
    block::Block, coin::Coin, transaction::OutPoint, BlockchainError, BlockchainResult,
};
use blockchain_crypto::Address;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Everything needed to reverse one connected block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    /// Coins consumed by the block, in spend order
    pub spent: Vec<Coin>,
    /// Outpoints the block created
    pub created: Vec<OutPoint>,
}

/// Unspent coins of the best chain
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    coins: HashMap<OutPoint, Coin>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.coins.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.coins.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Coin> {
        self.coins.values()
    }

    pub fn coins_owned_by(&self, owner: &Address) -> Vec<Coin> {
        self.coins
            .values()
            .filter(|coin| coin.owner() == *owner)
            .cloned()
            .collect()
    }

    /// Spend the inputs and add the outputs of every transaction in `block`.
    ///
    /// On error the set is left as it was before the call.
    pub fn apply_block(&mut self, block: &Block) -> BlockchainResult<BlockUndo> {
        let mut undo = BlockUndo::default();
        if let Err(e) = self.apply_into(block, &mut undo) {
            self.undo_block(undo);
            return Err(e);
        }
        Ok(undo)
    }

    fn apply_into(&mut self, block: &Block, undo: &mut BlockUndo) -> BlockchainResult<()> {
        let height = block.header.height;
        let block_time = block.header.timestamp;

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let coin = self.coins.remove(&input.prevout).ok_or_else(|| {
                        BlockchainError::InvalidTransaction(format!("missing input {}", input.prevout))
                    })?;
                    undo.spent.push(coin);
                }
            }
            for coin in Coin::from_transaction(tx, height, block_time) {
                undo.created.push(coin.outpoint);
                self.coins.insert(coin.outpoint, coin);
            }
        }

        Ok(())
    }

    /// Reverse a previously applied block
    pub fn undo_block(&mut self, undo: BlockUndo) {
        let created: HashSet<OutPoint> = undo.created.into_iter().collect();
        for outpoint in &created {
            self.coins.remove(outpoint);
        }
        // Outputs created and spent inside the same block were never in the set before it
        for coin in undo.spent {
            if !created.contains(&coin.outpoint) {
                self.coins.insert(coin.outpoint, coin);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::ProofKind,
        transaction::{Transaction, TxIn, TxOut},
        Amount,
    };
    use blockchain_crypto::{Hash, KeyPair};

    fn block(height: u64, transactions: Vec<Transaction>) -> Block {
        Block::new(Hash::zero(), height, 100 + height, 0x207fffff, ProofKind::Work, transactions)
    }

    #[test]
    fn test_apply_and_undo() {
        let alice = KeyPair::generate().address();
        let bob = KeyPair::generate().address();
        let mut utxo = UtxoSet::new();

        let cb = Transaction::coinbase(1, vec![TxOut::new(Amount::from_coins(10), alice)], 101);
        let cb_out = OutPoint::new(cb.txid(), 0);
        utxo.apply_block(&block(1, vec![cb])).unwrap();
        assert!(utxo.contains(&cb_out));

        let spend = Transaction::new(
            vec![TxIn::spend(cb_out)],
            vec![TxOut::new(Amount::from_coins(10), bob)],
            102,
        );
        let cb2 = Transaction::coinbase(2, vec![TxOut::new(Amount::from_coins(4), alice)], 102);
        let undo = utxo.apply_block(&block(2, vec![cb2, spend.clone()])).unwrap();
        assert!(!utxo.contains(&cb_out));
        assert_eq!(utxo.coins_owned_by(&bob).len(), 1);
        assert_eq!(undo.spent.len(), 1);

        utxo.undo_block(undo);
        assert!(utxo.contains(&cb_out));
        assert!(utxo.coins_owned_by(&bob).is_empty());
        assert_eq!(utxo.len(), 1);
    }

    #[test]
    fn test_failed_apply_leaves_set_untouched() {
        let alice = KeyPair::generate().address();
        let mut utxo = UtxoSet::new();
        let cb = Transaction::coinbase(1, vec![TxOut::new(Amount::from_coins(10), alice)], 101);
        utxo.apply_block(&block(1, vec![cb])).unwrap();

        let cb2 = Transaction::coinbase(2, vec![TxOut::new(Amount::from_coins(4), alice)], 102);
        let bogus = Transaction::new(
            vec![TxIn::spend(OutPoint::new(Hash::of(&"nowhere"), 0))],
            vec![TxOut::new(Amount::from_coins(1), alice)],
            102,
        );
        assert!(utxo.apply_block(&block(2, vec![cb2, bogus])).is_err());
        assert_eq!(utxo.len(), 1);
    }

    #[test]
    fn test_undo_in_block_chain_of_spends() {
        let alice = KeyPair::generate().address();
        let mut utxo = UtxoSet::new();
        let cb = Transaction::coinbase(1, vec![TxOut::new(Amount::from_coins(10), alice)], 101);
        let first = Transaction::new(
            vec![TxIn::spend(OutPoint::new(cb.txid(), 0))],
            vec![TxOut::new(Amount::from_coins(10), alice)],
            101,
        );
        let second = Transaction::new(
            vec![TxIn::spend(OutPoint::new(first.txid(), 0))],
            vec![TxOut::new(Amount::from_coins(9), alice)],
            101,
        );

        let undo = utxo.apply_block(&block(1, vec![cb, first, second])).unwrap();
        assert_eq!(utxo.len(), 1);
        utxo.undo_block(undo);
        assert!(utxo.is_empty());
    }
}
