// wallet/src/keystore.rs

//! Password-protected key files
//!
//! A keystore holds one Ed25519 secret sealed with ChaCha20-Poly1305 under a
//! key stretched from the wallet password with Argon2id. The file is JSON so
//! it can be inspected without exposing the secret.

use crate::WalletResult;
use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use blockchain_crypto::{Address, KeyPair, SecretKey};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use consensus::WalletError;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroizing;

const KEYSTORE_VERSION: u32 = 1;
const KDF_ALGORITHM: &str = "argon2id";
pub(crate) const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

fn kdf_params() -> WalletResult<Params> {
    ParamsBuilder::new()
        .m_cost(19 * 1024)
        .t_cost(2)
        .p_cost(1)
        .output_len(KEY_LEN)
        .build()
        .map_err(|e| WalletError::Other(format!("argon2 parameters: {}", e)))
}

/// Stretch `password` into a 32-byte key
pub(crate) fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> WalletResult<Zeroizing<[u8; KEY_LEN]>> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, kdf_params()?);
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut out[..])
        .map_err(|e| WalletError::Other(format!("argon2: {}", e)))?;
    Ok(out)
}

pub(crate) fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Sealed key as written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystore {
    pub version: u32,
    pub kdf: String,
    pub address: Address,
    salt: String,
    nonce: String,
    ciphertext: String,
}

impl Keystore {
    /// Seal the secret half of `keypair` under `password`
    pub fn seal(keypair: &KeyPair, password: &str) -> WalletResult<Self> {
        let salt = random_salt();
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let key = derive_key(password, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let secret = keypair.secret_key().to_bytes();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), &secret[..])
            .map_err(|_| WalletError::Other("keystore encryption failed".to_string()))?;

        Ok(Self {
            version: KEYSTORE_VERSION,
            kdf: KDF_ALGORITHM.to_string(),
            address: keypair.address(),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Recover the key pair; a wrong password fails with `Auth`
    pub fn open(&self, name: &str, password: &str) -> WalletResult<KeyPair> {
        if self.version != KEYSTORE_VERSION || self.kdf != KDF_ALGORITHM {
            return Err(WalletError::Other(format!(
                "unsupported keystore v{} ({})",
                self.version, self.kdf
            )));
        }
        let salt: [u8; SALT_LEN] = decode_fixed(&self.salt)?;
        let nonce: [u8; NONCE_LEN] = decode_fixed(&self.nonce)?;
        let ciphertext = hex::decode(&self.ciphertext).map_err(corrupt)?;

        let key = derive_key(password, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let secret = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| WalletError::Auth(name.to_string()))?,
        );
        let keypair = KeyPair::from_secret(SecretKey::from_bytes(&secret).map_err(corrupt)?);
        if keypair.address() != self.address {
            return Err(WalletError::Other("keystore address mismatch".to_string()));
        }
        Ok(keypair)
    }

    pub fn load(path: &Path) -> WalletResult<Self> {
        let data = std::fs::read_to_string(path).map_err(io_error)?;
        serde_json::from_str(&data).map_err(corrupt)
    }

    pub fn save(&self, path: &Path) -> WalletResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(corrupt)?;
        std::fs::write(path, data).map_err(io_error)?;
        info!("Wrote keystore for {} to {}", self.address, path.display());
        Ok(())
    }
}

/// Key file of wallet `name` under `dir`
pub fn keystore_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

fn decode_fixed<const N: usize>(value: &str) -> WalletResult<[u8; N]> {
    hex::decode(value)
        .map_err(corrupt)?
        .try_into()
        .map_err(|_| WalletError::Other("keystore field has wrong length".to_string()))
}

fn corrupt(e: impl std::fmt::Display) -> WalletError {
    WalletError::Other(format!("corrupt keystore: {}", e))
}

fn io_error(e: std::io::Error) -> WalletError {
    WalletError::Other(format!("keystore io: {}", e))
}
