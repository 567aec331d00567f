// blockchain-core/src/block.rs
use crate::{
    params::ConsensusParameters, transaction::{Transaction, TxOut}, types::*, BlockchainError,
    BlockchainResult,
};
use blockchain_crypto::{merkle_root, Address, Hash, KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};

pub const BLOCK_VERSION: u32 = 1;

/// How a block proves its right to extend the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofKind {
    Work,
    Stake,
}

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of previous block
    pub parent_hash: Hash,
    /// Block number/height
    pub height: BlockNumber,
    /// Block timestamp (seconds)
    pub timestamp: Timestamp,
    /// Merkle root of transaction ids
    pub transactions_root: Hash,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u64,
    pub proof: ProofKind,
}

impl BlockHeader {
    /// Calculate header hash
    pub fn hash(&self) -> Hash {
        Hash::of(self)
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.proof == ProofKind::Stake
    }
}

/// Signature by the staking key over the header hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl BlockSignature {
    pub fn signer(&self) -> Address {
        self.public_key.to_address()
    }
}

/// Complete block structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// First entry is the coinbase (work) or the coinstake (stake)
    pub transactions: Vec<Transaction>,
    /// Present on stake blocks only
    pub signature: Option<BlockSignature>,
}

impl Block {
    /// Assemble an unsigned block, computing the transactions root
    pub fn new(
        parent_hash: Hash,
        height: BlockNumber,
        timestamp: Timestamp,
        bits: u32,
        proof: ProofKind,
        transactions: Vec<Transaction>,
    ) -> Self {
        let header = BlockHeader {
            version: BLOCK_VERSION,
            parent_hash,
            height,
            timestamp,
            transactions_root: Self::compute_root(&transactions),
            bits,
            nonce: 0,
            proof,
        };

        Self {
            header,
            transactions,
            signature: None,
        }
    }

    /// Genesis block derived from the network parameters
    pub fn genesis(params: &ConsensusParameters) -> Self {
        let coinbase = Transaction::coinbase(0, vec![TxOut::empty()], params.genesis_timestamp);
        Self::new(
            Hash::zero(),
            0,
            params.genesis_timestamp,
            params.pow_limit_bits,
            ProofKind::Work,
            vec![coinbase],
        )
    }

    pub fn compute_root(transactions: &[Transaction]) -> Hash {
        let ids: Vec<Hash> = transactions.iter().map(|tx| tx.txid()).collect();
        merkle_root(&ids)
    }

    /// Get block hash
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> BlockNumber {
        self.header.height
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.header.is_proof_of_stake()
    }

    /// The coinstake transaction of a stake block
    pub fn coinstake(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinstake())
    }

    /// Sign the header hash; the signature does not cover itself
    pub fn sign(&mut self, keypair: &KeyPair) {
        let hash = self.hash();
        self.signature = Some(BlockSignature {
            public_key: *keypair.public_key(),
            signature: keypair.sign(hash.as_bytes()),
        });
    }

    /// Verify the block signature, returning the signer's address
    pub fn verify_signature(&self) -> BlockchainResult<Address> {
        let sig = self
            .signature
            .as_ref()
            .ok_or_else(|| BlockchainError::InvalidBlock("missing block signature".into()))?;
        let hash = self.hash();
        if sig.signature.verify(hash.as_bytes(), &sig.public_key)? {
            Ok(sig.signer())
        } else {
            Err(BlockchainError::InvalidBlock("bad block signature".into()))
        }
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.header.height == 0 && self.header.parent_hash == Hash::zero()
    }
}
