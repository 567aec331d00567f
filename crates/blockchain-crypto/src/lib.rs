// blockchain-crypto/src/lib.rs

//! Cryptographic primitives for the hybrid PoW/PoS node
//!
//! This crate provides:
//! - Double SHA-256 hashing of canonical (bincode) encodings
//! - Merkle roots over transaction ids
//! - Ed25519 staking keys and block signatures
//! - Addresses derived from public keys

pub mod hash;
pub mod signature;
pub mod keypair;
pub mod merkle;

pub use hash::{Hash, Hashable, HASH_SIZE};
pub use signature::Signature;
pub use keypair::{KeyPair, PublicKey, SecretKey, Address};
pub use merkle::merkle_root;

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid signature")]
    InvalidSignature,
    
    #[error("Invalid public key")]
    InvalidPublicKey,
    
    #[error("Invalid secret key")]
    InvalidSecretKey,
    
    #[error("Invalid hash")]
    InvalidHash,
    
    #[error("Serialization error: {0}")]
    SerializationError(String),
    
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_basics() {
        let keypair = KeyPair::generate();
        let message = b"coinstake header";
        let signature = keypair.sign(message);
        assert!(keypair.public_key().verify(message, &signature).unwrap());
    }
}
