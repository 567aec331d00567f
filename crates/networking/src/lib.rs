// networking/src/lib.rs

//! Networking Layer
//!
//! This crate provides:
//! - Protocol messages and their bincode wire encoding
//! - Peer bookkeeping with reputation and bans
//! - An in-process transport between node instances
//! - Tip convergence between peers

pub mod p2p;
pub mod peer;
pub mod protocol;
pub mod sync;

pub use p2p::{Frame, NetworkConfig, NetworkService};
pub use peer::{PeerId, PeerInfo, PeerManager, PeerStatus};
pub use protocol::ProtocolMessage;
pub use sync::{SyncConfig, SyncManager, SyncStatus};

use consensus::ConsensusError;

/// Result type for networking operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors that can occur during networking operations
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Peer error: {0}")]
    PeerError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
}
