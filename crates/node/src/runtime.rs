// node/src/runtime.rs
use crate::config::{NodeConfig, StorageBackend};
use blockchain_core::{Block, ConsensusParameters};
use blockchain_crypto::{Address, Hash};
use consensus::{
    BlockRelay, BlockVerdict, ChainEngine, ChainTip, MinterConfig, MinterEvent, PowMiner, StakeMinter,
    WalletSecret,
};
use networking::{NetworkConfig, NetworkService, SyncConfig, SyncManager};
use std::sync::Arc;
use storage::{BlockStore, Database, DatabaseConfig, MemoryStore};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use wallet::WalletManager;

/// Result of `Node::mine_blocks`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedBlocks {
    pub address_used: Address,
    pub hashes: Vec<Hash>,
}

pub struct Node {
    config: NodeConfig,
    params: Arc<ConsensusParameters>,
    engine: Arc<ChainEngine>,
    wallet: Arc<WalletManager>,
    minter: StakeMinter,
    network: Arc<NetworkService>,
    sync: Arc<SyncManager>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build a node for the configured network with its default parameters
    pub fn new(config: NodeConfig) -> anyhow::Result<Self> {
        let params = config.consensus_parameters();
        Self::with_parameters(config, params)
    }

    /// Build a node around explicit consensus parameters; the chain store is opened here
    pub fn with_parameters(config: NodeConfig, params: ConsensusParameters) -> anyhow::Result<Self> {
        tracing::info!("Initializing {} node components", params.network);
        let params = Arc::new(params);

        let store: Arc<dyn BlockStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::RocksDb => {
                std::fs::create_dir_all(&config.data_dir)?;
                Arc::new(Database::open(DatabaseConfig {
                    path: config.chain_dir(),
                    max_open_files: config.storage.max_open_files,
                    ..Default::default()
                })?)
            }
        };

        let engine = Arc::new(ChainEngine::open(params.clone(), store)?);
        let tip = engine.tip();
        tracing::info!("✓ Chain engine ready at #{} ({})", tip.height, tip.hash);

        let wallet = Arc::new(WalletManager::new());
        engine.add_observer(wallet.clone());

        let network = Arc::new(NetworkService::new(
            NetworkConfig::default(),
            params.network,
            Block::genesis(&params).hash(),
        ));
        let sync = Arc::new(SyncManager::new(
            engine.clone(),
            network.clone(),
            SyncConfig {
                batch_size: config.sync.batch_size,
            },
        ));

        let minter = StakeMinter::new(
            engine.clone(),
            wallet.clone(),
            MinterConfig {
                poll_interval: config.poll_interval(),
                max_candidates_per_round: config.staking.max_candidates_per_round,
                round_budget: config.round_budget(),
                ..Default::default()
            },
        );
        minter.set_relay(network.clone());

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            params,
            engine,
            wallet,
            minter,
            network,
            sync,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the message loop and the block logger
    pub async fn start(&self) -> anyhow::Result<()> {
        let inbox = self
            .network
            .take_inbox()
            .ok_or_else(|| anyhow::anyhow!("node already started"))?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(
            self.sync.clone().run(inbox, self.shutdown_tx.subscribe()),
        ));
        tracing::info!("✓ Sync service started as peer {}", self.network.id());

        tasks.push(self.start_block_logger());

        let tip = self.engine.tip();
        tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        tracing::info!("  🚀 Node is fully operational!");
        tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        tracing::info!("  Network:  {}", self.params.network);
        tracing::info!("  Tip:      #{} ({})", tip.height, tip.hash);
        tracing::info!("  Storage:  {:?}", self.config.storage.backend);
        tracing::info!("  Data Dir: {}", self.config.data_dir);
        tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        Ok(())
    }

    fn start_block_logger(&self) -> JoinHandle<()> {
        let mut events = self.minter.subscribe_events();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(MinterEvent::BlockProduced { hash, height, staked, payout }) => {
                            tracing::info!(
                                "✓ Staked block #{} ({}) with {}:{}, paid {}",
                                height, hash, staked.txid, staked.vout, payout
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!("Block logger missed {} events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Load wallet `name` from its keystore under the data directory, or
    /// create one, then replay the active chain into it
    pub fn open_wallet(&self, name: &str, password: &str) -> anyhow::Result<Address> {
        let address = self.wallet.open_or_create(&self.config.wallet_dir(), name, password)?;
        let tip = self.engine.tip();
        let mut blocks = Vec::with_capacity(tip.height as usize);
        for height in 1..=tip.height {
            match self.engine.block_at_height(height)? {
                Some(block) => blocks.push(block),
                None => anyhow::bail!("active chain has no block at height {}", height),
            }
        }
        self.wallet.rescan(name, &blocks)?;
        tracing::info!("Wallet '{}' at {} opened at tip #{}", name, address, tip.height);
        Ok(address)
    }

    /// Unlock the wallet and start minting; fails when staking is disabled
    pub async fn start_staking(&self, secret: WalletSecret) -> anyhow::Result<()> {
        if !self.config.staking.enabled {
            anyhow::bail!("staking is disabled in the node configuration");
        }
        self.minter.start(secret).await?;
        Ok(())
    }

    /// Stop minting and drop the unlocked key
    pub async fn stop_staking(&self) {
        self.minter.stop().await;
    }

    /// Current best tip
    pub fn chain_tip(&self) -> ChainTip {
        self.engine.tip()
    }

    /// Validate a block from outside the node; new blocks are relayed to peers
    pub fn submit_external_block(&self, block: Block) -> anyhow::Result<BlockVerdict> {
        let verdict = self.engine.submit_block(block.clone())?;
        if let BlockVerdict::Accepted(accepted) = &verdict {
            if !accepted.already_known {
                self.network.broadcast_block(&block);
            }
        }
        Ok(verdict)
    }

    /// Mine `count` proof-of-work blocks paying the staking wallet
    pub async fn mine_blocks(&self, count: usize) -> anyhow::Result<MinedBlocks> {
        let address = self.wallet.address(&self.config.staking.wallet)?;
        let miner = PowMiner::new(self.engine.clone());
        let hashes = tokio::task::spawn_blocking(move || miner.generate(count, address)).await??;
        tracing::info!("Mined {} blocks to {}", hashes.len(), address);
        Ok(MinedBlocks {
            address_used: address,
            hashes,
        })
    }

    /// Link this node with `other` over the in-process transport
    pub fn connect(&self, other: &Node) -> anyhow::Result<()> {
        self.network.connect(&other.network)?;
        Ok(())
    }

    /// Wait until the tip matches what `other` last announced
    pub async fn wait_for_sync(&self, other: &Node) -> anyhow::Result<()> {
        self.sync
            .wait_for_convergence(other.network.id(), self.config.sync_timeout())
            .await?;
        Ok(())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn params(&self) -> &Arc<ConsensusParameters> {
        &self.params
    }

    pub fn engine(&self) -> &Arc<ChainEngine> {
        &self.engine
    }

    pub fn wallet(&self) -> &Arc<WalletManager> {
        &self.wallet
    }

    pub fn minter(&self) -> &StakeMinter {
        &self.minter
    }

    pub fn network(&self) -> &Arc<NetworkService> {
        &self.network
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Stop staking and every background task, then wait for them
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Shutting down node...");
        self.minter.stop().await;
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.await?;
        }
        for peer in self.network.connected_peers() {
            self.network.disconnect(peer);
        }

        tracing::info!("Node shutdown complete");
        Ok(())
    }
}

/// Poll `predicate` every `poll` until it holds; false once `timeout` passes
pub async fn wait_until<F>(timeout: Duration, poll: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_node_creation() {
        let node = Node::new(NodeConfig::regtest()).unwrap();
        assert_eq!(node.chain_tip().height, 0);
        assert_eq!(node.chain_tip().hash, Block::genesis(node.params()).hash());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice_fails() {
        let node = Node::new(NodeConfig::regtest()).unwrap();
        node.start().await.unwrap();
        assert!(node.start().await.is_err());
        node.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mining_needs_wallet() {
        let node = Node::new(NodeConfig::regtest()).unwrap();
        assert!(node.mine_blocks(1).await.is_err());

        let address = node.wallet().create_wallet("staking", "pw").unwrap();
        let mined = node.mine_blocks(3).await.unwrap();
        assert_eq!(mined.address_used, address);
        assert_eq!(mined.hashes.len(), 3);
        assert_eq!(node.chain_tip().hash, mined.hashes[2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_staking_disabled() {
        let mut config = NodeConfig::regtest();
        config.staking.enabled = false;
        let node = Node::new(config).unwrap();
        node.wallet().create_wallet("staking", "pw").unwrap();
        assert!(node.start_staking(WalletSecret::new("staking", "pw")).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_wallet_rescans_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::regtest();
        config.data_dir = dir.path().to_string_lossy().into_owned();
        let node = Node::new(config.clone()).unwrap();

        let address = node.open_wallet("staking", "pw").unwrap();
        assert!(config.wallet_dir().join("staking.json").exists());
        node.mine_blocks(3).await.unwrap();
        let balance = node.wallet().balance("staking").unwrap();

        // Reopening reads the same key back and finds its coins on chain.
        node.wallet().remove_wallet("staking").unwrap();
        assert!(node.open_wallet("staking", "wrong").is_err());
        assert_eq!(node.open_wallet("staking", "pw").unwrap(), address);
        assert_eq!(node.wallet().balance("staking").unwrap(), balance);
        assert_eq!(node.wallet().transactions("staking").unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_until_bounded() {
        let started = Instant::now();
        assert!(!wait_until(Duration::from_millis(50), Duration::from_millis(10), || false).await);
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut calls = 0;
        assert!(
            wait_until(Duration::from_secs(1), Duration::from_millis(1), || {
                calls += 1;
                calls == 3
            })
            .await
        );
    }
}
