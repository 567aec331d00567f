// networking/src/peer.rs

use crate::{protocol::StatusMessage, NetworkError, NetworkResult};
use blockchain_core::{BlockNumber, ChainWork, Timestamp};
use blockchain_crypto::Hash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use consensus::PeerId;

/// Random identifier for a new service
pub fn random_peer_id() -> PeerId {
    rand::random()
}

/// Peer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Linked, handshake not yet received
    Connecting,
    /// Connected and handshake complete
    Connected,
    Disconnected,
    /// Banned due to misbehavior
    Banned,
}

/// Peer information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Current status
    pub status: PeerStatus,
    /// Last announced tip
    pub best_height: BlockNumber,
    pub best_hash: Option<Hash>,
    pub chain_work: ChainWork,
    /// Connection timestamp
    pub connected_at: Timestamp,
    /// Last message timestamp
    pub last_seen: Timestamp,
    /// Reputation score
    pub reputation: i32,
    /// Is this an outbound connection (we initiated)
    pub outbound: bool,
}

impl PeerInfo {
    /// Create peer info for a link that is still handshaking
    pub fn new(id: PeerId, outbound: bool) -> Self {
        let now = current_timestamp();
        Self {
            id,
            status: PeerStatus::Connecting,
            best_height: 0,
            best_hash: None,
            chain_work: ChainWork::zero(),
            connected_at: now,
            last_seen: now,
            reputation: 0,
            outbound,
        }
    }

    /// Update last seen timestamp
    pub fn update_last_seen(&mut self) {
        self.last_seen = current_timestamp();
    }

    /// Check if peer is connected
    pub fn is_connected(&self) -> bool {
        self.status == PeerStatus::Connected
    }

    /// Check if peer is banned
    pub fn is_banned(&self) -> bool {
        self.status == PeerStatus::Banned
    }

    /// Increase reputation, capped at 1000
    pub fn increase_reputation(&mut self, amount: i32) {
        self.reputation = self.reputation.saturating_add(amount).min(1000);
    }

    /// Peers falling below -100 are banned
    pub fn decrease_reputation(&mut self, amount: i32) {
        self.reputation = self.reputation.saturating_sub(amount);
        if self.reputation < -100 {
            self.status = PeerStatus::Banned;
        }
    }
}

/// Peer manager
pub struct PeerManager {
    /// All known peers
    peers: HashMap<PeerId, PeerInfo>,
    /// Maximum peers to maintain
    max_peers: usize,
    /// Maximum inbound connections
    max_inbound: usize,
    /// Maximum outbound connections
    max_outbound: usize,
}

impl PeerManager {
    /// Create new peer manager
    pub fn new(max_peers: usize, max_inbound: usize, max_outbound: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            max_inbound,
            max_outbound,
        }
    }

    /// Add a peer, respecting the inbound and outbound limits
    pub fn add_peer(&mut self, peer: PeerInfo) -> NetworkResult<()> {
        if self.peers.len() >= self.max_peers {
            return Err(NetworkError::PeerError("Maximum peers reached".into()));
        }

        let (inbound_count, outbound_count) = self.connection_counts();
        if peer.outbound && outbound_count >= self.max_outbound {
            return Err(NetworkError::PeerError("Maximum outbound connections reached".into()));
        }
        if !peer.outbound && inbound_count >= self.max_inbound {
            return Err(NetworkError::PeerError("Maximum inbound connections reached".into()));
        }

        self.peers.insert(peer.id, peer);
        Ok(())
    }

    /// Remove a peer
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.remove(peer_id)
    }

    /// Get peer info
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    /// Get mutable peer info
    pub fn get_peer_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerInfo> {
        self.peers.get_mut(peer_id)
    }

    /// Get all connected peers
    pub fn connected_peers(&self) -> Vec<&PeerInfo> {
        self.peers.values().filter(|p| p.is_connected()).collect()
    }

    /// Get peer count, whatever the status
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peer counts as (inbound, outbound)
    pub fn connection_counts(&self) -> (usize, usize) {
        let mut inbound = 0;
        let mut outbound = 0;

        for peer in self.peers.values() {
            if peer.outbound {
                outbound += 1;
            } else {
                inbound += 1;
            }
        }

        (inbound, outbound)
    }

    /// Update peer status
    pub fn set_status(&mut self, peer_id: &PeerId, status: PeerStatus) -> NetworkResult<()> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| NetworkError::PeerError(format!("Peer {} not found", peer_id)))?;
        peer.status = status;
        Ok(())
    }

    /// Record the tip a peer announced
    pub fn update_tip(&mut self, peer_id: &PeerId, status: &StatusMessage) -> NetworkResult<()> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| NetworkError::PeerError(format!("Peer {} not found", peer_id)))?;
        peer.best_height = status.height;
        peer.best_hash = Some(status.hash);
        peer.chain_work = status.chain_work.clone();
        peer.update_last_seen();
        Ok(())
    }

    /// Ban a peer
    pub fn ban_peer(&mut self, peer_id: &PeerId, reason: &str) -> NetworkResult<()> {
        self.set_status(peer_id, PeerStatus::Banned)?;
        tracing::warn!("Peer {} banned: {}", peer_id, reason);
        Ok(())
    }

    /// Connected peer announcing the most work
    pub fn best_peer(&self) -> Option<&PeerInfo> {
        self.connected_peers().into_iter().max_by(|a, b| a.chain_work.cmp(&b.chain_work))
    }
}

fn current_timestamp() -> Timestamp {
    chrono::Utc::now().timestamp().max(0) as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_peer(outbound: bool) -> PeerInfo {
        PeerInfo::new(random_peer_id(), outbound)
    }

    #[test]
    fn test_peer_manager() {
        let mut manager = PeerManager::new(100, 50, 50);

        let peer = create_test_peer(true);
        let peer_id = peer.id;

        manager.add_peer(peer).unwrap();
        assert_eq!(manager.peer_count(), 1);
        assert!(manager.get_peer(&peer_id).is_some());
    }

    #[test]
    fn test_max_peers_limit() {
        let mut manager = PeerManager::new(2, 1, 1);

        manager.add_peer(create_test_peer(true)).unwrap();
        manager.add_peer(create_test_peer(false)).unwrap();

        assert!(manager.add_peer(create_test_peer(true)).is_err());
    }

    #[test]
    fn test_reputation() {
        let mut peer = create_test_peer(true);

        peer.increase_reputation(50);
        assert_eq!(peer.reputation, 50);

        peer.decrease_reputation(100);
        assert_eq!(peer.reputation, -50);

        peer.decrease_reputation(100);
        assert!(peer.is_banned());
    }

    #[test]
    fn test_ban_peer() {
        let mut manager = PeerManager::new(100, 50, 50);
        let peer = create_test_peer(true);
        let peer_id = peer.id;
        manager.add_peer(peer).unwrap();
        manager.set_status(&peer_id, PeerStatus::Connected).unwrap();

        manager.ban_peer(&peer_id, "invalid block").unwrap();
        assert!(manager.get_peer(&peer_id).unwrap().is_banned());
        assert!(manager.connected_peers().is_empty());
        assert!(manager.best_peer().is_none());
        assert!(manager.ban_peer(&random_peer_id(), "unknown").is_err());
    }

    #[test]
    fn test_best_peer_by_work() {
        let mut manager = PeerManager::new(100, 50, 50);
        let light = create_test_peer(true);
        let heavy = create_test_peer(true);
        let (light_id, heavy_id) = (light.id, heavy.id);
        manager.add_peer(light).unwrap();
        manager.add_peer(heavy).unwrap();

        for (id, height, bits) in [(light_id, 100, 0x207fffff), (heavy_id, 10, 0x1e0fffff)] {
            manager.set_status(&id, PeerStatus::Connected).unwrap();
            let status = StatusMessage {
                height,
                hash: Hash::of(&height),
                chain_work: ChainWork::from_bits(bits),
            };
            manager.update_tip(&id, &status).unwrap();
        }

        assert_eq!(manager.best_peer().unwrap().id, heavy_id);
        assert_eq!(manager.get_peer(&light_id).unwrap().best_height, 100);
    }
}
