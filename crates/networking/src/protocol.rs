// networking/src/protocol.rs

use crate::{NetworkError, NetworkResult};
use blockchain_core::{Block, BlockNumber, ChainWork, Network, Transaction};
use blockchain_crypto::Hash;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Protocol message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Sent by both sides on connect
    Handshake(HandshakeMessage),
    /// Tip announcement
    Status(StatusMessage),
    /// Request best-chain blocks after a locator
    GetBlocks(GetBlocksMessage),
    /// Answer to `GetBlocks`, ancestor first
    Blocks(BlocksMessage),
    /// Newly produced block
    NewBlock(NewBlockMessage),
    NewTransaction(NewTransactionMessage),
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub protocol_version: u32,
    pub network: Network,
    pub genesis_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub height: BlockNumber,
    pub hash: Hash,
    pub chain_work: ChainWork,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksMessage {
    pub locator: Vec<Hash>,
    pub max_blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksMessage {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlockMessage {
    pub block: Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransactionMessage {
    pub transaction: Transaction,
}

impl ProtocolMessage {
    /// Wire encoding
    pub fn encode(&self) -> NetworkResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| NetworkError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> NetworkResult<Self> {
        bincode::deserialize(bytes).map_err(|e| NetworkError::InvalidMessage(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Handshake(_) => "handshake",
            ProtocolMessage::Status(_) => "status",
            ProtocolMessage::GetBlocks(_) => "getblocks",
            ProtocolMessage::Blocks(_) => "blocks",
            ProtocolMessage::NewBlock(_) => "newblock",
            ProtocolMessage::NewTransaction(_) => "newtx",
            ProtocolMessage::Ping => "ping",
            ProtocolMessage::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockchain_core::ConsensusParameters;

    #[test]
    fn test_block_message_survives_encoding() {
        let genesis = Block::genesis(&ConsensusParameters::regtest());
        let msg = ProtocolMessage::NewBlock(NewBlockMessage { block: genesis });
        let bytes = msg.encode().unwrap();
        assert_eq!(ProtocolMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert!(matches!(
            ProtocolMessage::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(NetworkError::InvalidMessage(_))
        ));
    }
}
