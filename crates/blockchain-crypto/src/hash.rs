// blockchain-crypto/src/hash.rs

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;

/// Hash output size in bytes
pub const HASH_SIZE: usize = 32;

/// A 32-byte double SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Create a new hash from bytes
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a hash from a slice (returns error if wrong length)
    pub fn from_slice(slice: &[u8]) -> Result<Self, crate::CryptoError> {
        let bytes: [u8; HASH_SIZE] = slice
            .try_into()
            .map_err(|_| crate::CryptoError::InvalidHash)?;
        Ok(Self(bytes))
    }

    /// Hash the canonical bincode encoding of `value`
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Self {
        let mut writer = DigestWriter(Sha256::new());
        // Writing into a digest cannot fail and every hashed type is plain data.
        bincode::serialize_into(&mut writer, value)
            .expect("canonical encoding of consensus data is infallible");
        let first = writer.0.finalize();
        Self(Sha256::digest(first).into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; HASH_SIZE] {
        self.0
    }

    /// The all-zero hash (parent of genesis)
    pub fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, crate::CryptoError> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::CryptoError::DeserializationError(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...{})", 
               hex::encode(&self.0[..4]), 
               hex::encode(&self.0[28..]))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::zero()
    }
}

/// Trait for byte strings that can be hashed
pub trait Hashable {
    /// Single SHA-256
    fn sha256(&self) -> Hash;
    /// SHA-256 applied twice
    fn sha256d(&self) -> Hash;
}

impl Hashable for [u8] {
    fn sha256(&self) -> Hash {
        Hash::new(Sha256::digest(self).into())
    }

    fn sha256d(&self) -> Hash {
        let first = Sha256::digest(self);
        Hash::new(Sha256::digest(first).into())
    }
}

impl Hashable for Vec<u8> {
    fn sha256(&self) -> Hash {
        self.as_slice().sha256()
    }

    fn sha256d(&self) -> Hash {
        self.as_slice().sha256d()
    }
}

struct DigestWriter(Sha256);

impl io::Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"Hello, World!";
        assert_eq!(data.sha256d(), data.sha256d());
        assert_ne!(data.sha256(), data.sha256d());
    }

    #[test]
    fn test_hash_of_matches_encoded_bytes() {
        let value = (42u64, "kernel");
        let encoded = bincode::serialize(&value).unwrap();
        assert_eq!(Hash::of(&value), encoded.sha256d());
    }

    #[test]
    fn test_hash_hex() {
        let hash = b"test".sha256d();
        let parsed = Hash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(Hash::from_slice(&[0u8; 31]).is_err());
        assert!(Hash::zero().is_zero());
    }
}
