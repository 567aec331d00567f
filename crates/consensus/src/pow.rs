// consensus/src/pow.rs

use crate::{
    engine::{BlockVerdict, ChainEngine},
    rules, ConsensusError, ConsensusResult,
};
use blockchain_core::{Block, ProofKind, Transaction, TxOut};
use blockchain_crypto::{Address, Hash};
use std::sync::Arc;
use tracing::info;

/// Largest number of pool transactions put in a mined block
const MAX_BLOCK_TRANSACTIONS: usize = 1_000;

/// Proof-of-work block generator for the distribution phase
pub struct PowMiner {
    engine: Arc<ChainEngine>,
}

impl PowMiner {
    pub fn new(engine: Arc<ChainEngine>) -> Self {
        Self { engine }
    }

    /// Mine `count` blocks on the tip, each paying its reward to `address`.
    /// Returns the hashes of the accepted blocks. Nonce search is CPU bound;
    /// async callers should run this on a blocking thread.
    pub fn generate(&self, count: usize, address: Address) -> ConsensusResult<Vec<Hash>> {
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(self.mine_one(address)?);
        }
        Ok(hashes)
    }

    fn mine_one(&self, address: Address) -> ConsensusResult<Hash> {
        let params = self.engine.params().clone();
        let tip = self.engine.tip();
        let parent = self
            .engine
            .header(&tip.hash)
            .ok_or(blockchain_core::BlockchainError::BlockNotFound(tip.hash))?;
        let height = parent.height + 1;
        let timestamp = self.engine.clock().now().max(parent.timestamp + 1);

        let template = self.engine.block_template(MAX_BLOCK_TRANSACTIONS, None)?;
        let reward = params
            .pow_reward(height)
            .checked_add(template.fees)
            .ok_or_else(|| ConsensusError::Config("block reward overflows".into()))?;

        let mut transactions = vec![Transaction::coinbase(height, vec![TxOut::new(reward, address)], timestamp)];
        transactions.extend(template.transactions);

        let bits = self.engine.next_bits(&parent, ProofKind::Work);
        let mut block = Block::new(tip.hash, height, timestamp, bits, ProofKind::Work, transactions);
        while rules::check_proof_of_work(&block).is_err() {
            block.header.nonce = block.header.nonce.wrapping_add(1);
            if block.header.nonce == 0 {
                block.header.timestamp += 1;
            }
        }

        match self.engine.submit_if_tip(block, &tip.hash)? {
            BlockVerdict::Accepted(accepted) => {
                info!("⛏ Mined block #{} ({}) paying {} to {}", accepted.height, accepted.hash, reward, address);
                Ok(accepted.hash)
            }
            BlockVerdict::Rejected(reason) => Err(ConsensusError::Rejected(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockchain_core::ConsensusParameters;
    use blockchain_crypto::KeyPair;
    use storage::MemoryStore;

    fn engine(params: ConsensusParameters) -> Arc<ChainEngine> {
        Arc::new(ChainEngine::open(Arc::new(params), Arc::new(MemoryStore::new())).unwrap())
    }

    #[test]
    fn test_generate_pays_rewards() {
        let engine = engine(ConsensusParameters::regtest());
        let miner = PowMiner::new(engine.clone());
        let address = KeyPair::generate().address();

        let hashes = miner.generate(2, address).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(engine.tip().hash, hashes[1]);

        let params = engine.params();
        let total = engine
            .coins_owned_by(&address)
            .iter()
            .fold(0u64, |sum, coin| sum + coin.value().units());
        assert_eq!(total, params.premine_reward.units() + params.proof_of_work_reward.units());
    }

    #[test]
    fn test_generate_past_cutoff_is_rejected() {
        let mut params = ConsensusParameters::regtest();
        params.last_pow_block_height = 2;
        let engine = engine(params);
        let miner = PowMiner::new(engine.clone());
        let address = KeyPair::generate().address();

        miner.generate(2, address).unwrap();
        match miner.generate(1, address) {
            Err(ConsensusError::Rejected(reason)) => assert_eq!(reason.as_str(), rules::POW_TOO_HIGH),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(engine.tip().height, 2);
    }
}
