// blockchain-crypto/src/signature.rs

use crate::{CryptoError, CryptoResult, PublicKey};
use ed25519_dalek::Verifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ed25519 signature over a block header hash
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub(crate) fn from_dalek(signature: ed25519_dalek::Signature) -> Self {
        Self(signature.to_bytes().to_vec())
    }

    /// Wrap raw signature bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Malformed signatures are an error; well-formed but wrong ones verify to `false`
    pub fn verify(&self, message: &[u8], public_key: &PublicKey) -> CryptoResult<bool> {
        let sig = ed25519_dalek::Signature::from_slice(&self.0)
            .map_err(|_| CryptoError::InvalidSignature)?;
        let key = public_key.verifying_key()?;
        Ok(key.verify(message, &sig).is_ok())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.0[..8.min(self.0.len())]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    #[test]
    fn test_signature_verifies_only_signed_message() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"header");
        assert!(signature.verify(b"header", keypair.public_key()).unwrap());
        assert!(!signature.verify(b"other header", keypair.public_key()).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = KeyPair::generate();
        let other = KeyPair::generate();
        let signature = signer.sign(b"header");
        assert!(!signature.verify(b"header", other.public_key()).unwrap());
    }

    #[test]
    fn test_malformed_signature_is_error() {
        let keypair = KeyPair::generate();
        let signature = Signature::from_bytes(vec![1, 2, 3]);
        assert!(signature.verify(b"header", keypair.public_key()).is_err());
    }
}
