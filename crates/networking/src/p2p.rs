// networking/src/p2p.rs

//! In-process transport. Every service owns an inbox; connecting two
//! services hands each the other's inbox sender. Messages travel as
//! bincode-encoded frames so the wire codec is exercised end to end.

use crate::{
    peer::{random_peer_id, PeerId, PeerInfo, PeerManager, PeerStatus},
    protocol::{HandshakeMessage, NewBlockMessage, ProtocolMessage, StatusMessage, PROTOCOL_VERSION},
    NetworkError, NetworkResult,
};
use blockchain_core::{Block, Network};
use blockchain_crypto::Hash;
use consensus::BlockRelay;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Peer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Maximum peers to maintain
    pub max_peers: usize,
    /// Maximum inbound connections
    pub max_inbound: usize,
    /// Maximum outbound connections
    pub max_outbound: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_peers: 16,
            max_inbound: 8,
            max_outbound: 8,
        }
    }
}

/// One encoded message and its sender
#[derive(Debug, Clone)]
pub struct Frame {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// One node's endpoint: its inbox, links to peers and peer bookkeeping
pub struct NetworkService {
    id: PeerId,
    network: Network,
    genesis_hash: Hash,
    inbox_tx: mpsc::UnboundedSender<Frame>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    links: RwLock<HashMap<PeerId, mpsc::UnboundedSender<Frame>>>,
    peers: Mutex<PeerManager>,
}

impl NetworkService {
    /// Create a service with a fresh random peer id
    pub fn new(config: NetworkConfig, network: Network, genesis_hash: Hash) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            id: random_peer_id(),
            network,
            genesis_hash,
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            links: RwLock::new(HashMap::new()),
            peers: Mutex::new(PeerManager::new(config.max_peers, config.max_inbound, config.max_outbound)),
        }
    }

    /// This service's peer id
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Incoming frames; can be taken once, by the message loop
    pub fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.inbox_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Link with `other` in both directions and exchange handshakes
    pub fn connect(&self, other: &NetworkService) -> NetworkResult<()> {
        if other.id == self.id {
            return Err(NetworkError::ConnectionError("cannot connect to self".into()));
        }
        self.peers().add_peer(PeerInfo::new(other.id, true))?;
        if let Err(e) = other.peers().add_peer(PeerInfo::new(self.id, false)) {
            self.peers().remove_peer(&other.id);
            return Err(e);
        }

        self.write_links().insert(other.id, other.inbox_tx.clone());
        other.write_links().insert(self.id, self.inbox_tx.clone());

        self.send_to(other.id, &self.handshake())?;
        other.send_to(self.id, &other.handshake())?;
        info!("Connected to peer {}", other.id);
        Ok(())
    }

    /// Drop the link to `peer` and forget it
    pub fn disconnect(&self, peer: PeerId) {
        self.write_links().remove(&peer);
        if self.peers().remove_peer(&peer).is_some() {
            info!("Disconnected from peer {}", peer);
        }
    }

    /// Handshake announcing our network, genesis and protocol version
    pub fn handshake(&self) -> ProtocolMessage {
        ProtocolMessage::Handshake(HandshakeMessage {
            protocol_version: PROTOCOL_VERSION,
            network: self.network,
            genesis_hash: self.genesis_hash,
        })
    }

    /// Accept or refuse a peer's handshake; refused peers are dropped
    pub fn handle_handshake(&self, from: PeerId, handshake: &HandshakeMessage) -> NetworkResult<()> {
        if handshake.network != self.network || handshake.genesis_hash != self.genesis_hash {
            self.disconnect(from);
            return Err(NetworkError::ProtocolError(format!(
                "peer {} is on {} with genesis {}",
                from, handshake.network, handshake.genesis_hash
            )));
        }
        if handshake.protocol_version != PROTOCOL_VERSION {
            self.disconnect(from);
            return Err(NetworkError::ProtocolError(format!(
                "peer {} speaks protocol {}",
                from, handshake.protocol_version
            )));
        }
        self.peers().set_status(&from, PeerStatus::Connected)
    }

    /// Encode and deliver `msg` to one peer
    pub fn send_to(&self, peer: PeerId, msg: &ProtocolMessage) -> NetworkResult<()> {
        let payload = msg.encode()?;
        let link = self
            .links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .cloned()
            .ok_or_else(|| NetworkError::ConnectionError(format!("no link to peer {}", peer)))?;
        link.send(Frame { from: self.id, payload })
            .map_err(|_| NetworkError::ConnectionError(format!("peer {} went away", peer)))?;
        debug!("Sent {} to {}", msg.kind(), peer);
        Ok(())
    }

    /// Send to every connected peer except `exclude`; returns how many got it
    pub fn broadcast(&self, msg: &ProtocolMessage, exclude: Option<PeerId>) -> usize {
        let targets: Vec<PeerId> = self
            .peers()
            .connected_peers()
            .into_iter()
            .map(|peer| peer.id)
            .filter(|id| Some(*id) != exclude)
            .collect();

        let mut sent = 0;
        for peer in targets {
            match self.send_to(peer, msg) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Dropping {} to {}: {}", msg.kind(), peer, e),
            }
        }
        sent
    }

    /// Record the tip a peer announced in its status
    pub fn record_status(&self, from: PeerId, status: &StatusMessage) -> NetworkResult<()> {
        self.peers().update_tip(&from, status)
    }

    /// Lower a peer's reputation after bad data
    pub fn penalize(&self, peer: PeerId, amount: i32) {
        if let Some(info) = self.peers().get_peer_mut(&peer) {
            info.decrease_reputation(amount);
            if info.is_banned() {
                warn!("Peer {} banned for misbehavior", peer);
            }
        }
    }

    /// Ban `peer` outright and drop its link
    pub fn ban(&self, peer: PeerId, reason: &str) {
        if self.peers().ban_peer(&peer, reason).is_ok() {
            self.write_links().remove(&peer);
        }
    }

    /// Connected peer announcing the most chain work
    pub fn best_peer(&self) -> Option<PeerInfo> {
        self.peers().best_peer().cloned()
    }

    /// Snapshot of what we know about `peer`
    pub fn peer_info(&self, peer: PeerId) -> Option<PeerInfo> {
        self.peers().get_peer(&peer).cloned()
    }

    /// Ids of peers that completed the handshake
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers().connected_peers().into_iter().map(|peer| peer.id).collect()
    }

    /// Check if `peer` is banned
    pub fn is_banned(&self, peer: PeerId) -> bool {
        self.peers().get_peer(&peer).is_some_and(|info| info.is_banned())
    }

    fn peers(&self) -> MutexGuard<'_, PeerManager> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_links(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PeerId, mpsc::UnboundedSender<Frame>>> {
        self.links.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlockRelay for NetworkService {
    fn broadcast_block(&self, block: &Block) {
        let sent = self.broadcast(&ProtocolMessage::NewBlock(NewBlockMessage { block: block.clone() }), None);
        debug!("Relayed block #{} to {} peers", block.height(), sent);
    }

    fn peer_tip(&self, peer: PeerId) -> Option<Hash> {
        self.peers().get_peer(&peer).and_then(|info| info.best_hash)
    }
}
