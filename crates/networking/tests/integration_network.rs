// networking/tests/integration_network.rs

use blockchain_core::{Block, ConsensusParameters};
use blockchain_crypto::Address;
use consensus::{ChainEngine, PowMiner};
use networking::{NetworkConfig, NetworkError, NetworkService, SyncConfig, SyncManager, SyncStatus};
use std::sync::Arc;
use std::time::Duration;
use storage::MemoryStore;
use tokio::sync::watch;

struct Peer {
    engine: Arc<ChainEngine>,
    network: Arc<NetworkService>,
    sync: Arc<SyncManager>,
}

fn spawn_peer(shutdown: &watch::Receiver<bool>) -> Peer {
    let params = Arc::new(ConsensusParameters::regtest());
    let genesis = Block::genesis(&params).hash();
    let engine = Arc::new(ChainEngine::open(params.clone(), Arc::new(MemoryStore::new())).unwrap());
    let network = Arc::new(NetworkService::new(NetworkConfig::default(), params.network, genesis));
    let sync = Arc::new(SyncManager::new(engine.clone(), network.clone(), SyncConfig { batch_size: 8 }));

    let inbox = network.take_inbox().unwrap();
    tokio::spawn(sync.clone().run(inbox, shutdown.clone()));
    Peer { engine, network, sync }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_joiner_converges() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let a = spawn_peer(&shutdown_rx);
    let b = spawn_peer(&shutdown_rx);

    let miner = PowMiner::new(a.engine.clone());
    tokio::task::spawn_blocking(move || miner.generate(30, Address::new([7; 20])))
        .await
        .unwrap()
        .unwrap();

    a.network.connect(&b.network).unwrap();
    b.sync
        .wait_for_convergence(a.network.id(), Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(b.engine.tip(), a.engine.tip());
    assert_eq!(b.engine.tip().height, 30);
    assert_eq!(b.sync.status(), SyncStatus::Synced);

    shutdown_tx.send(true).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocks_mined_after_connect_propagate() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let a = spawn_peer(&shutdown_rx);
    let b = spawn_peer(&shutdown_rx);
    a.network.connect(&b.network).unwrap();

    let miner = PowMiner::new(a.engine.clone());
    tokio::task::spawn_blocking(move || miner.generate(5, Address::new([7; 20])))
        .await
        .unwrap()
        .unwrap();

    let target = a.engine.tip();
    let mut tip_rx = b.engine.subscribe_tip();
    tokio::time::timeout(Duration::from_secs(10), tip_rx.wait_for(|tip| *tip == target))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.engine.tip().height, 5);

    shutdown_tx.send(true).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_foreign_network_never_converges() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let a = spawn_peer(&shutdown_rx);

    let main = ConsensusParameters::main();
    let stranger = NetworkService::new(NetworkConfig::default(), main.network, Block::genesis(&main).hash());
    a.network.connect(&stranger).unwrap();

    let result = a
        .sync
        .wait_for_convergence(stranger.id(), Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(NetworkError::Timeout)));
    assert!(a.network.connected_peers().is_empty());

    shutdown_tx.send(true).unwrap();
}
