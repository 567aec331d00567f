// blockchain-core/src/params.rs

use crate::{Amount, BlockNumber, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network the node runs on; chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    RegTest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::RegTest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            "regtest" => Ok(Network::RegTest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Immutable per-network consensus constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParameters {
    pub network: Network,
    /// Height after which proof-of-work blocks are invalid
    pub last_pow_block_height: BlockNumber,
    /// Confirmations before coinbase/coinstake outputs may be spent
    pub coinbase_maturity: u64,
    /// Confirmations before a coin may be staked (the maturity window)
    pub stake_min_confirmations: u64,
    pub premine_height: BlockNumber,
    pub premine_reward: Amount,
    pub proof_of_work_reward: Amount,
    pub proof_of_stake_reward: Amount,
    /// BIP-44 coin type used by wallets
    pub coin_type: u32,
    pub pow_limit_bits: u32,
    pub pos_limit_bits: u32,
    /// Seconds a block timestamp may run ahead of local time
    pub max_future_block_time: u64,
    /// Stake block timestamps must have these low bits clear
    pub stake_timestamp_mask: u64,
    pub max_reorg_depth: u64,
    pub genesis_timestamp: Timestamp,
}

impl ConsensusParameters {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Main => Self::main(),
            Network::Test => Self::test(),
            Network::RegTest => Self::regtest(),
        }
    }

    pub fn main() -> Self {
        Self {
            network: Network::Main,
            last_pow_block_height: 12_500,
            coinbase_maturity: 50,
            stake_min_confirmations: 50,
            premine_height: 2,
            premine_reward: Amount::from_coins(98_000_000),
            proof_of_work_reward: Amount::from_coins(4),
            proof_of_stake_reward: Amount::from_coins(1),
            coin_type: 105,
            pow_limit_bits: 0x1e0f_ffff,
            pos_limit_bits: 0x1e0f_ffff,
            max_future_block_time: 2 * 60 * 60,
            stake_timestamp_mask: 0x0f,
            max_reorg_depth: 500,
            genesis_timestamp: 1_470_467_000,
        }
    }

    pub fn test() -> Self {
        Self {
            network: Network::Test,
            coinbase_maturity: 10,
            stake_min_confirmations: 20,
            coin_type: 1,
            pow_limit_bits: 0x1f0f_ffff,
            pos_limit_bits: 0x1f0f_ffff,
            genesis_timestamp: 1_470_467_100,
            ..Self::main()
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: Network::RegTest,
            coinbase_maturity: 10,
            stake_min_confirmations: 10,
            coin_type: 1,
            pow_limit_bits: 0x207f_ffff,
            pos_limit_bits: 0x207f_ffff,
            stake_timestamp_mask: 0,
            genesis_timestamp: 1_470_467_200,
            ..Self::main()
        }
    }

    /// Proof-of-work subsidy at `height`
    pub fn pow_reward(&self, height: BlockNumber) -> Amount {
        if height == 0 {
            Amount::zero()
        } else if height == self.premine_height {
            self.premine_reward
        } else {
            self.proof_of_work_reward
        }
    }

    pub fn pos_allowed(&self, height: BlockNumber) -> bool {
        height > 0
    }

    pub fn pow_allowed(&self, height: BlockNumber) -> bool {
        height <= self.last_pow_block_height
    }

    /// Clear the masked low bits of a stake timestamp
    pub fn mask_stake_time(&self, timestamp: Timestamp) -> Timestamp {
        timestamp & !self.stake_timestamp_mask
    }
}
