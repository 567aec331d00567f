// node/src/config.rs
use blockchain_core::{BlockNumber, ConsensusParameters, Network};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: String,
    pub network: Network,
    pub storage: StorageConfig,
    pub staking: StakingConfig,
    pub sync: SyncSettings,
    #[serde(default)]
    pub consensus: ConsensusOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    RocksDb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub max_open_files: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingConfig {
    pub enabled: bool,
    /// Wallet that receives mined rewards and stakes its coins
    pub wallet: String,
    pub poll_interval_ms: u64,
    pub max_candidates_per_round: usize,
    pub round_budget_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub timeout_secs: u64,
}

/// Per-node changes to the network's consensus constants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pow_block_height: Option<BlockNumber>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            network: Network::Main,
            storage: StorageConfig {
                backend: StorageBackend::RocksDb,
                max_open_files: 1024,
            },
            staking: StakingConfig {
                enabled: true,
                wallet: "staking".into(),
                poll_interval_ms: 500,
                max_candidates_per_round: 64,
                round_budget_ms: 250,
            },
            sync: SyncSettings {
                batch_size: 500,
                timeout_secs: 30,
            },
            consensus: ConsensusOverrides::default(),
        }
    }
}

impl NodeConfig {
    /// In-memory regtest node, used by tests and local experiments
    pub fn regtest() -> Self {
        let mut config = Self {
            network: Network::RegTest,
            ..Self::default()
        };
        config.storage.backend = StorageBackend::Memory;
        config.staking.poll_interval_ms = 50;
        config
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Write the configuration as TOML
    pub fn to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Network constants with this node's overrides applied
    pub fn consensus_parameters(&self) -> ConsensusParameters {
        let mut params = ConsensusParameters::for_network(self.network);
        if let Some(height) = self.consensus.last_pow_block_height {
            params.last_pow_block_height = height;
        }
        params
    }

    /// RocksDB directory of the chain store
    pub fn chain_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("chain")
    }

    /// Keystore files, one per wallet
    pub fn wallet_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("wallets")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.staking.poll_interval_ms)
    }

    pub fn round_budget(&self) -> Duration {
        Duration::from_millis(self.staking.round_budget_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout_secs)
    }
}
