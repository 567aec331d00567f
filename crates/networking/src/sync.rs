// networking/src/sync.rs

//! Tip convergence.
//!
//! Peers announce their tip with `Status`. A node that hears of more work
//! than it has asks for blocks after its locator, feeds the answer to the
//! chain engine in order and keeps asking while the peer is still ahead.

use crate::{
    p2p::{Frame, NetworkService},
    peer::PeerId,
    protocol::{BlocksMessage, GetBlocksMessage, NewBlockMessage, ProtocolMessage, StatusMessage},
    NetworkError, NetworkResult,
};
use blockchain_core::{Block, BlockNumber};
use consensus::{BlockVerdict, BlockRelay, ChainEngine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const CONVERGENCE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Idle,
    Syncing { current: BlockNumber, target: BlockNumber },
    Synced,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Most blocks requested or served per `GetBlocks`
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

pub struct SyncManager {
    engine: Arc<ChainEngine>,
    network: Arc<NetworkService>,
    config: SyncConfig,
    status: watch::Sender<SyncStatus>,
}

impl SyncManager {
    pub fn new(engine: Arc<ChainEngine>, network: Arc<NetworkService>, config: SyncConfig) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self { engine, network, config, status }
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self.status(), SyncStatus::Syncing { .. })
    }

    /// Process frames and announce tip changes until `shutdown` fires or
    /// every sender is gone
    pub async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Frame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tip_rx = self.engine.subscribe_tip();
        loop {
            tokio::select! {
                frame = inbox.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => break,
                },
                changed = tip_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let _ = tip_rx.borrow_and_update();
                    self.announce_tip();
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Sync loop for {} exited", self.network.id());
    }

    fn handle_frame(&self, frame: Frame) {
        let msg = match ProtocolMessage::decode(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", frame.from, e);
                self.network.penalize(frame.from, 10);
                return;
            }
        };
        let kind = msg.kind();
        if let Err(e) = self.handle_message(frame.from, msg) {
            warn!("Handling {} from {} failed: {}", kind, frame.from, e);
        }
    }

    pub fn handle_message(&self, from: PeerId, msg: ProtocolMessage) -> NetworkResult<()> {
        if self.network.is_banned(from) {
            return Ok(());
        }

        match msg {
            ProtocolMessage::Handshake(handshake) => {
                self.network.handle_handshake(from, &handshake)?;
                self.network.send_to(from, &ProtocolMessage::Status(self.local_status()))
            }
            ProtocolMessage::Status(status) => self.on_status(from, status),
            ProtocolMessage::GetBlocks(request) => {
                let max = request.max_blocks.min(self.config.batch_size);
                let blocks = self.engine.blocks_after(&request.locator, max)?;
                debug!("Serving {} blocks to {}", blocks.len(), from);
                self.network.send_to(from, &ProtocolMessage::Blocks(BlocksMessage { blocks }))
            }
            ProtocolMessage::Blocks(batch) => self.on_blocks(from, batch.blocks),
            ProtocolMessage::NewBlock(announcement) => self.on_new_block(from, announcement.block),
            ProtocolMessage::NewTransaction(msg) => {
                match self.engine.submit_transaction(msg.transaction) {
                    Ok(txid) => debug!("Pooled transaction {} from {}", txid, from),
                    Err(e) => debug!("Ignoring transaction from {}: {}", from, e),
                }
                Ok(())
            }
            ProtocolMessage::Ping => self.network.send_to(from, &ProtocolMessage::Pong),
            ProtocolMessage::Pong => Ok(()),
        }
    }

    pub fn local_status(&self) -> StatusMessage {
        let tip = self.engine.tip();
        StatusMessage {
            height: tip.height,
            hash: tip.hash,
            chain_work: tip.chain_work,
        }
    }

    /// Send the current tip to every connected peer
    pub fn announce_tip(&self) {
        let status = self.local_status();
        let sent = self.network.broadcast(&ProtocolMessage::Status(status.clone()), None);
        debug!("Announced tip #{} ({}) to {} peers", status.height, status.hash, sent);
    }

    fn on_status(&self, from: PeerId, status: StatusMessage) -> NetworkResult<()> {
        self.network.record_status(from, &status)?;
        self.follow_peer(from)
    }

    /// Request more blocks if `peer`, or a connected peer with even more
    /// work, is ahead of us
    fn follow_peer(&self, peer: PeerId) -> NetworkResult<()> {
        let Some(announced) = self.network.peer_info(peer) else {
            return Ok(());
        };
        let info = match self.network.best_peer() {
            Some(best) if best.chain_work > announced.chain_work => best,
            _ => announced,
        };
        let local = self.engine.tip();

        if info.chain_work > local.chain_work {
            self.status.send_replace(SyncStatus::Syncing {
                current: local.height,
                target: info.best_height,
            });
            return self.request_blocks(info.id);
        }
        if info.best_hash == Some(local.hash) {
            if self.status.send_replace(SyncStatus::Synced) != SyncStatus::Synced {
                info!("✓ In sync with {} at #{} ({})", info.id, local.height, local.hash);
            }
        } else if self.is_syncing() {
            self.status.send_replace(SyncStatus::Idle);
        }
        Ok(())
    }

    fn request_blocks(&self, peer: PeerId) -> NetworkResult<()> {
        let locator = self.engine.locator()?;
        self.network.send_to(
            peer,
            &ProtocolMessage::GetBlocks(GetBlocksMessage {
                locator,
                max_blocks: self.config.batch_size,
            }),
        )
    }

    fn on_blocks(&self, from: PeerId, blocks: Vec<Block>) -> NetworkResult<()> {
        if blocks.is_empty() {
            debug!("Peer {} had no blocks past our locator", from);
            return Ok(());
        }

        let received = blocks.len();
        for block in blocks {
            let height = block.height();
            match self.engine.submit_block(block)? {
                BlockVerdict::Accepted(_) => {}
                BlockVerdict::Rejected(reason) if reason.is_orphan() => {
                    // Repeated orphan batches get the peer banned.
                    debug!("Block #{} from {} does not connect, re-requesting", height, from);
                    self.network.penalize(from, 10);
                    return self.request_blocks(from);
                }
                BlockVerdict::Rejected(reason) if reason.is_transient() => {
                    // Retried on the peer's next tip announcement.
                    debug!("Block #{} from {} not acceptable yet: {}", height, from, reason);
                    return Ok(());
                }
                BlockVerdict::Rejected(reason) => {
                    warn!("Peer {} sent unacceptable block #{}: {}", from, height, reason);
                    self.network.ban(from, reason.as_str());
                    return Ok(());
                }
            }
        }

        let tip = self.engine.tip();
        debug!("Applied {} blocks from {}, tip now #{}", received, from, tip.height);
        self.follow_peer(from)
    }

    fn on_new_block(&self, from: PeerId, block: Block) -> NetworkResult<()> {
        let height = block.height();
        let hash = block.hash();
        match self.engine.submit_block(block.clone())? {
            BlockVerdict::Accepted(accepted) => {
                if !accepted.already_known {
                    debug!("Accepted announced block #{} ({}) from {}", height, hash, from);
                    self.network.broadcast(&ProtocolMessage::NewBlock(NewBlockMessage { block }), Some(from));
                }
                Ok(())
            }
            BlockVerdict::Rejected(reason) if reason.is_orphan() => {
                debug!("Announced block #{} from {} is an orphan, requesting blocks", height, from);
                self.request_blocks(from)
            }
            BlockVerdict::Rejected(reason) if reason.is_transient() => {
                debug!("Announced block #{} from {} not acceptable yet: {}", height, from, reason);
                Ok(())
            }
            BlockVerdict::Rejected(reason) => {
                warn!("Peer {} announced invalid block #{}: {}", from, height, reason);
                self.network.penalize(from, 20);
                Ok(())
            }
        }
    }

    /// Whether the local tip equals the tip `peer` last announced
    pub fn is_converged_with(&self, peer: PeerId) -> bool {
        self.network.peer_tip(peer) == Some(self.engine.tip().hash)
    }

    /// Wait until the local tip equals the tip `peer` announced, or fail with
    /// `Timeout`
    pub async fn wait_for_convergence(&self, peer: PeerId, timeout: Duration) -> NetworkResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_converged_with(peer) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NetworkError::Timeout);
            }
            tokio::time::sleep(CONVERGENCE_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::NetworkConfig;
    use blockchain_core::ConsensusParameters;
    use blockchain_crypto::Address;
    use consensus::PowMiner;
    use storage::MemoryStore;

    struct Side {
        engine: Arc<ChainEngine>,
        network: Arc<NetworkService>,
        sync: Arc<SyncManager>,
        inbox: mpsc::UnboundedReceiver<Frame>,
    }

    fn side() -> Side {
        let params = Arc::new(ConsensusParameters::regtest());
        let genesis = Block::genesis(&params).hash();
        let engine = Arc::new(ChainEngine::open(params.clone(), Arc::new(MemoryStore::new())).unwrap());
        let network = Arc::new(NetworkService::new(NetworkConfig::default(), params.network, genesis));
        let inbox = network.take_inbox().unwrap();
        let sync = Arc::new(SyncManager::new(engine.clone(), network.clone(), SyncConfig { batch_size: 4 }));
        Side { engine, network, sync, inbox }
    }

    /// Deliver queued frames on both sides until neither has anything left
    fn pump(a: &mut Side, b: &mut Side) {
        loop {
            let mut moved = false;
            for side in [&mut *a, &mut *b] {
                while let Ok(frame) = side.inbox.try_recv() {
                    side.sync.handle_frame(frame);
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }

    #[test]
    fn test_fresh_node_catches_up_in_batches() {
        let (mut a, mut b) = (side(), side());
        PowMiner::new(a.engine.clone()).generate(10, Address::new([1; 20])).unwrap();

        a.network.connect(&b.network).unwrap();
        pump(&mut a, &mut b);

        assert_eq!(b.engine.tip(), a.engine.tip());
        assert_eq!(b.sync.status(), SyncStatus::Synced);
        assert!(b.sync.is_converged_with(a.network.id()));
    }

    #[test]
    fn test_new_block_propagates() {
        let (mut a, mut b) = (side(), side());
        a.network.connect(&b.network).unwrap();
        pump(&mut a, &mut b);

        PowMiner::new(a.engine.clone()).generate(1, Address::new([1; 20])).unwrap();
        let block = a.engine.block_at_height(1).unwrap().unwrap();
        a.network.broadcast_block(&block);
        pump(&mut a, &mut b);

        assert_eq!(b.engine.tip().hash, block.hash());
    }

    #[test]
    fn test_orphan_announcement_triggers_request() {
        let (mut a, mut b) = (side(), side());
        a.network.connect(&b.network).unwrap();
        pump(&mut a, &mut b);

        PowMiner::new(a.engine.clone()).generate(3, Address::new([1; 20])).unwrap();
        let tip_block = a.engine.block_at_height(3).unwrap().unwrap();
        // Only the newest block is announced; b has to fetch its ancestors.
        a.network.broadcast_block(&tip_block);
        while let Ok(frame) = b.inbox.try_recv() {
            b.sync.handle_frame(frame);
        }
        pump(&mut a, &mut b);

        assert_eq!(b.engine.tip().hash, tip_block.hash());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_for_convergence_times_out() {
        let (a, b) = (side(), side());
        a.network.connect(&b.network).unwrap();
        let result = b
            .sync
            .wait_for_convergence(a.network.id(), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(NetworkError::Timeout)));
    }

    /// Decoded messages waiting in a side's inbox, left unhandled
    fn drain(side: &mut Side) -> Vec<ProtocolMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = side.inbox.try_recv() {
            out.push(ProtocolMessage::decode(&frame.payload).unwrap());
        }
        out
    }

    #[test]
    fn test_invalid_batch_bans_peer() {
        let (mut a, mut b) = (side(), side());
        a.network.connect(&b.network).unwrap();
        pump(&mut a, &mut b);

        PowMiner::new(a.engine.clone()).generate(1, Address::new([1; 20])).unwrap();
        let mut bad = a.engine.block_at_height(1).unwrap().unwrap();
        bad.transactions[0].timestamp += 1;
        b.sync
            .handle_message(a.network.id(), ProtocolMessage::Blocks(BlocksMessage { blocks: vec![bad] }))
            .unwrap();

        assert!(b.network.is_banned(a.network.id()));
        assert!(b.network.connected_peers().is_empty());
        assert_eq!(b.engine.tip().height, 0);
    }

    #[test]
    fn test_sync_follows_peer_with_most_work() {
        let (mut a, mut b, mut c) = (side(), side(), side());
        PowMiner::new(a.engine.clone()).generate(2, Address::new([1; 20])).unwrap();
        PowMiner::new(b.engine.clone()).generate(6, Address::new([2; 20])).unwrap();

        c.network.connect(&a.network).unwrap();
        c.network.connect(&b.network).unwrap();
        // Complete the handshakes on c only.
        while let Ok(frame) = c.inbox.try_recv() {
            if let Ok(ProtocolMessage::Handshake(hs)) = ProtocolMessage::decode(&frame.payload) {
                c.network.handle_handshake(frame.from, &hs).unwrap();
            }
        }
        drain(&mut a);
        drain(&mut b);

        c.network.record_status(b.network.id(), &b.sync.local_status()).unwrap();
        c.sync
            .handle_message(a.network.id(), ProtocolMessage::Status(a.sync.local_status()))
            .unwrap();

        assert!(drain(&mut b).iter().any(|msg| matches!(msg, ProtocolMessage::GetBlocks(_))));
        assert!(!drain(&mut a).iter().any(|msg| matches!(msg, ProtocolMessage::GetBlocks(_))));
        assert_eq!(c.sync.status(), SyncStatus::Syncing { current: 0, target: 6 });
    }
}
