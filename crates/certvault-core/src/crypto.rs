use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{RepositoryError, RepositoryResult};

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;
pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Argon2id cost parameters. Written into every container header so a store
/// stays readable after the configured costs change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time_cost: KDF_TIME_COST,
            memory_cost: KDF_MEMORY_COST,
            parallelism: KDF_PARALLELISM,
        }
    }
}

impl KdfParams {
    fn to_argon(self) -> RepositoryResult<Params> {
        Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            Some(DERIVED_KEY_LEN),
        )
        .map_err(|e| RepositoryError::Crypto(format!("argon2 params: {e}")))
    }

    pub fn validate(&self) -> RepositoryResult<()> {
        self.to_argon().map(|_| ())
    }
}

pub fn derive_key(
    passphrase: &str,
    salt: &[u8],
    params: KdfParams,
) -> RepositoryResult<Zeroizing<Vec<u8>>> {
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon()?);
    let mut key = Zeroizing::new(vec![0u8; DERIVED_KEY_LEN]);
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| RepositoryError::Crypto(format!("argon2 derive: {e}")))?;
    Ok(key)
}

pub fn encrypt(key: &[u8], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> RepositoryResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|e| RepositoryError::Crypto(format!("encrypt: {e}")))
}

/// Decrypts and authenticates. The error carries no detail beyond the tag
/// mismatch; callers translate it into `StoreCorrupt`.
pub fn decrypt(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, chacha20poly1305::aead::Error> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Hex SHA-256 of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}
