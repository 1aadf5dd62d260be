//! Encrypted credential store file.
//!
//! A store is one file: a fixed-size header carrying the KDF parameters, salt
//! and nonce, followed by an XChaCha20-Poly1305 ciphertext of a JSON payload
//! that maps serial numbers to entries. Each entry's private key is sealed a
//! second time under a key derived from the entry passphrase (the serial
//! number), so unlocking the store alone never yields key material in one step.
//!
//! The whole file is read on open and rewritten on persist. A mutation is only
//! durable once `persist` has returned; anything changed in memory before that
//! is lost if the process dies.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::certificate::Certificate;
use crate::credential::PrivateKey;
use crate::crypto::{
    decrypt, derive_key, encrypt, generate_nonce, generate_salt, KdfParams, NONCE_LEN, SALT_LEN,
};
use crate::error::{RepositoryError, RepositoryResult};

pub const VAULT_MAGIC: &[u8] = b"CVAULT1\0";
pub const VAULT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;
/// Upper bound on the Argon2 memory cost accepted from a header (4 GiB).
pub const MAX_KDF_MEMORY_COST: u32 = 4 * 1024 * 1024;
/// Upper bounds on the other header KDF costs, so a tampered header cannot
/// stall `open`.
pub const MAX_KDF_TIME_COST: u32 = 64;
pub const MAX_KDF_PARALLELISM: u32 = 64;

#[derive(Debug, Clone)]
pub struct VaultHeader {
    pub version: u32,
    pub entry_count: u32,
    pub kdf: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl VaultHeader {
    fn new(kdf: KdfParams) -> Self {
        Self {
            version: VAULT_VERSION,
            entry_count: 0,
            kdf,
            salt: generate_salt(),
            nonce: generate_nonce(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[..VAULT_MAGIC.len()].copy_from_slice(VAULT_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kdf.time_cost.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kdf.memory_cost.to_le_bytes());
        buf[24..28].copy_from_slice(&self.kdf.parallelism.to_le_bytes());
        buf[28..60].copy_from_slice(&self.salt);
        buf[60..84].copy_from_slice(&self.nonce);
        // remaining bytes stay zero
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, String> {
        if buf.len() != HEADER_SIZE {
            return Err("invalid header size".into());
        }
        if &buf[..VAULT_MAGIC.len()] != VAULT_MAGIC {
            return Err("invalid magic".into());
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let version = word(8);
        if version != VAULT_VERSION {
            return Err(format!("unsupported store version {version}"));
        }
        let kdf = KdfParams {
            time_cost: word(16),
            memory_cost: word(20),
            parallelism: word(24),
        };
        if kdf.memory_cost > MAX_KDF_MEMORY_COST {
            return Err(format!("kdf memory cost {} out of range", kdf.memory_cost));
        }
        if kdf.time_cost > MAX_KDF_TIME_COST {
            return Err(format!("kdf time cost {} out of range", kdf.time_cost));
        }
        if kdf.parallelism > MAX_KDF_PARALLELISM {
            return Err(format!("kdf parallelism {} out of range", kdf.parallelism));
        }
        kdf.validate().map_err(|e| format!("kdf parameters rejected: {e}"))?;
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[28..60]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[60..84]);
        Ok(Self {
            version,
            entry_count: word(12),
            kdf,
            salt,
            nonce,
        })
    }
}

/// What a sealed slot holds. Only `PrivateKey` slots are handed out as keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    #[default]
    PrivateKey,
    Secret,
}

/// A secret encrypted under a key derived from the per-entry passphrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedKey {
    #[serde(default)]
    pub kind: SlotKind,
    pub kdf: KdfParams,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub chain: Vec<String>,
    #[serde(default)]
    pub key: Option<SealedKey>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultPayload {
    store_id: String,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    #[serde(default)]
    entries: BTreeMap<String, StoredEntry>,
}

/// In-memory image of one store file.
pub struct CredentialStore {
    path: PathBuf,
    header: VaultHeader,
    payload: VaultPayload,
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("store_id", &self.payload.store_id)
            .field("entries", &self.payload.entries.len())
            .finish()
    }
}

impl CredentialStore {
    /// A fresh, empty store bound to `path`. Nothing is written until `persist`.
    pub fn create<P: AsRef<Path>>(path: P, passphrase: &str, kdf: KdfParams) -> RepositoryResult<Self> {
        let header = VaultHeader::new(kdf);
        let key = derive_key(passphrase, &header.salt, kdf)?;
        let now = Utc::now();
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            header,
            payload: VaultPayload {
                store_id: Uuid::new_v4().to_string(),
                created_at: now,
                last_modified: now,
                entries: BTreeMap::new(),
            },
            key,
        })
    }

    /// Loads the store at `path`, or returns a fresh empty one if the file does
    /// not exist. `kdf` only applies to a fresh store; an existing file carries
    /// its own parameters.
    pub fn open<P: AsRef<Path>>(path: P, passphrase: &str, kdf: KdfParams) -> RepositoryResult<Self> {
        let path = path.as_ref();
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "credential store absent, starting empty");
                return Self::create(path, passphrase, kdf);
            }
            Err(source) => {
                return Err(RepositoryError::StoreAccess {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|source| RepositoryError::StoreAccess {
                path: path.to_path_buf(),
                source,
            })?;
        if raw.len() < HEADER_SIZE {
            return Err(RepositoryError::corrupt(path, "truncated header"));
        }
        let header = VaultHeader::from_bytes(&raw[..HEADER_SIZE])
            .map_err(|reason| RepositoryError::corrupt(path, reason))?;
        let key = derive_key(passphrase, &header.salt, header.kdf)?;
        let plaintext = decrypt(&key, &header.nonce, &raw[HEADER_SIZE..])
            .map_err(|_| RepositoryError::corrupt(path, "authentication failed"))?;
        let payload: VaultPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| RepositoryError::corrupt(path, format!("parse payload: {e}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            payload,
            key,
        })
    }

    /// Rewrites the whole file. The new contents land in a temporary file in
    /// the same directory and are renamed over the old one, so readers see
    /// either the previous store or the new one.
    pub fn persist(&mut self) -> RepositoryResult<()> {
        let write_err = |source| RepositoryError::StoreWrite {
            path: self.path.clone(),
            source,
        };
        self.payload.last_modified = Utc::now();
        self.header.entry_count = self.payload.entries.len() as u32;
        // fresh nonce on every save
        self.header.nonce = generate_nonce();
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&self.payload)
                .map_err(|e| RepositoryError::Crypto(format!("serialize payload: {e}")))?,
        );
        let ciphertext = encrypt(&self.key, &self.header.nonce, &plaintext)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(write_err)?;
        let mut staging = NamedTempFile::new_in(&dir).map_err(write_err)?;
        staging
            .write_all(&self.header.to_bytes())
            .map_err(write_err)?;
        staging.write_all(&ciphertext).map_err(write_err)?;
        staging.as_file().sync_all().map_err(write_err)?;
        staging
            .persist(&self.path)
            .map_err(|e| write_err(e.error))?;
        debug!(
            path = %self.path.display(),
            entries = self.payload.entries.len(),
            "credential store persisted"
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store_id(&self) -> &str {
        &self.payload.store_id
    }

    pub fn len(&self) -> usize {
        self.payload.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.entries.is_empty()
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.payload.entries.contains_key(serial)
    }

    pub fn serials(&self) -> Vec<String> {
        self.payload.entries.keys().cloned().collect()
    }

    /// Inserts or replaces the entry under `serial`, sealing `key` with the
    /// serial number as its passphrase.
    pub fn set_entry(
        &mut self,
        serial: &str,
        chain: &[Certificate],
        key: Option<&PrivateKey>,
    ) -> RepositoryResult<()> {
        let sealed = match key {
            Some(key) => Some(seal(serial, key.pkcs8_der(), self.header.kdf)?),
            None => None,
        };
        let entry = StoredEntry {
            chain: chain
                .iter()
                .map(|c| general_purpose::STANDARD.encode(c.der()))
                .collect(),
            key: sealed,
            stored_at: Utc::now(),
        };
        self.payload.entries.insert(serial.to_string(), entry);
        Ok(())
    }

    pub fn remove(&mut self, serial: &str) -> bool {
        self.payload.entries.remove(serial).is_some()
    }

    /// The chain stored under `serial`, leaf first.
    pub fn chain(&self, serial: &str) -> RepositoryResult<Option<Vec<Certificate>>> {
        let Some(entry) = self.payload.entries.get(serial) else {
            return Ok(None);
        };
        let chain = entry
            .chain
            .iter()
            .map(|encoded| {
                general_purpose::STANDARD
                    .decode(encoded)
                    .map(Certificate::from_stored)
                    .map_err(|e| RepositoryError::corrupt(&self.path, format!("decode chain: {e}")))
            })
            .collect::<RepositoryResult<Vec<_>>>()?;
        Ok(Some(chain))
    }

    /// Unseals the private key under `serial`. An entry without a private-key
    /// slot is `NotAPrivateKey`; a slot that fails to unseal is `StoreCorrupt`.
    pub fn private_key(&self, serial: &str) -> RepositoryResult<Option<PrivateKey>> {
        let Some(entry) = self.payload.entries.get(serial) else {
            return Ok(None);
        };
        let sealed = entry
            .key
            .as_ref()
            .filter(|slot| slot.kind == SlotKind::PrivateKey)
            .ok_or_else(|| RepositoryError::NotAPrivateKey(serial.to_string()))?;
        let der = unseal(serial, sealed).map_err(|reason| RepositoryError::corrupt(&self.path, reason))?;
        Ok(Some(PrivateKey::from_pkcs8_der(der.to_vec())))
    }
}

fn seal(passphrase: &str, secret: &[u8], kdf: KdfParams) -> RepositoryResult<SealedKey> {
    let salt = generate_salt();
    let nonce = generate_nonce();
    let key = derive_key(passphrase, &salt, kdf)?;
    let ciphertext = encrypt(&key, &nonce, secret)?;
    Ok(SealedKey {
        kind: SlotKind::PrivateKey,
        kdf,
        salt: general_purpose::STANDARD.encode(salt),
        nonce: general_purpose::STANDARD.encode(nonce),
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
    })
}

fn unseal(passphrase: &str, sealed: &SealedKey) -> Result<Zeroizing<Vec<u8>>, String> {
    let decode = |field: &str, value: &str| {
        general_purpose::STANDARD
            .decode(value)
            .map_err(|e| format!("decode key slot {field}: {e}"))
    };
    let salt = decode("salt", &sealed.salt)?;
    let nonce: [u8; NONCE_LEN] = decode("nonce", &sealed.nonce)?
        .try_into()
        .map_err(|_| "key slot nonce length invalid".to_string())?;
    let ciphertext = decode("ciphertext", &sealed.ciphertext)?;
    let key = derive_key(passphrase, &salt, sealed.kdf).map_err(|e| e.to_string())?;
    decrypt(&key, &nonce, &ciphertext).map_err(|_| "key slot authentication failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast() -> KdfParams {
        KdfParams {
            time_cost: 1,
            memory_cost: 64,
            parallelism: 1,
        }
    }

    fn cert() -> Certificate {
        let params = rcgen::CertificateParams::new(vec!["vault.test".to_string()]).unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        Certificate::from_der(params.self_signed(&key).unwrap().der().to_vec()).unwrap()
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.cvault");
        let store = CredentialStore::open(&path, "pw", fast()).unwrap();
        assert!(store.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn persist_and_reopen_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.cvault");
        let leaf = cert();
        let key = PrivateKey::from_pkcs8_der(vec![0x30, 1, 2, 3]);
        let mut store = CredentialStore::open(&path, "pw", fast()).unwrap();
        store.set_entry("42", &[leaf.clone()], Some(&key)).unwrap();
        store.persist().unwrap();

        let reopened = CredentialStore::open(&path, "pw", KdfParams::default()).unwrap();
        assert_eq!(reopened.store_id(), store.store_id());
        assert_eq!(reopened.chain("42").unwrap().unwrap(), vec![leaf]);
        assert_eq!(reopened.private_key("42").unwrap().unwrap(), key);
    }

    #[test]
    fn key_material_is_not_in_cleartext() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.cvault");
        let marker = b"PLAINTEXT-KEY-MARKER".to_vec();
        let mut store = CredentialStore::open(&path, "pw", fast()).unwrap();
        store
            .set_entry("7", &[cert()], Some(&PrivateKey::from_pkcs8_der(marker.clone())))
            .unwrap();
        store.persist().unwrap();
        let raw = fs::read(&path).unwrap();
        assert!(!raw.windows(marker.len()).any(|w| w == &marker[..]));
    }

    #[test]
    fn wrong_passphrase_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.cvault");
        let mut store = CredentialStore::open(&path, "pw1", fast()).unwrap();
        store.persist().unwrap();
        let err = CredentialStore::open(&path, "pw2", fast()).unwrap_err();
        assert!(matches!(err, RepositoryError::StoreCorrupt { .. }));
    }

    #[test]
    fn garbage_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.cvault");
        fs::write(&path, b"not a store").unwrap();
        let err = CredentialStore::open(&path, "pw", fast()).unwrap_err();
        assert!(matches!(err, RepositoryError::StoreCorrupt { .. }));

        let mut bogus = vec![0u8; HEADER_SIZE + 16];
        bogus[..8].copy_from_slice(b"NOTMAGIC");
        fs::write(&path, bogus).unwrap();
        assert!(matches!(
            CredentialStore::open(&path, "pw", fast()).unwrap_err(),
            RepositoryError::StoreCorrupt { .. }
        ));
    }

    #[test]
    fn directory_path_is_access_error() {
        let dir = tempdir().unwrap();
        let err = CredentialStore::open(dir.path(), "pw", fast()).unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::StoreAccess { .. } | RepositoryError::StoreCorrupt { .. }
        ));
    }

    #[test]
    fn certificate_only_entry_is_not_a_private_key() {
        let dir = tempdir().unwrap();
        let mut store = CredentialStore::open(dir.path().join("c"), "pw", fast()).unwrap();
        store.set_entry("9", &[cert()], None).unwrap();
        assert!(matches!(
            store.private_key("9"),
            Err(RepositoryError::NotAPrivateKey(_))
        ));
        assert!(store.private_key("10").unwrap().is_none());
    }

    #[test]
    fn secret_slot_is_not_a_private_key() {
        let dir = tempdir().unwrap();
        let mut store = CredentialStore::open(dir.path().join("c"), "pw", fast()).unwrap();
        let key = PrivateKey::from_pkcs8_der(vec![0x30, 0x00]);
        store.set_entry("11", &[cert()], Some(&key)).unwrap();
        if let Some(slot) = store
            .payload
            .entries
            .get_mut("11")
            .and_then(|e| e.key.as_mut())
        {
            slot.kind = SlotKind::Secret;
        }
        assert!(matches!(
            store.private_key("11"),
            Err(RepositoryError::NotAPrivateKey(_))
        ));
    }

    fn tamper_header_word(path: &Path, at: usize, value: u32) {
        let mut raw = fs::read(path).unwrap();
        raw[at..at + 4].copy_from_slice(&value.to_le_bytes());
        fs::write(path, raw).unwrap();
    }

    #[test]
    fn tampered_kdf_params_are_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.cvault");
        // (offset, value): zero parallelism, zero time cost, huge time cost,
        // huge parallelism
        for (at, value) in [(24, 0), (16, 0), (16, u32::MAX), (24, u32::MAX)] {
            let mut store = CredentialStore::create(&path, "pw", fast()).unwrap();
            store.persist().unwrap();
            tamper_header_word(&path, at, value);
            let err = CredentialStore::open(&path, "pw", fast()).unwrap_err();
            assert!(
                matches!(err, RepositoryError::StoreCorrupt { .. }),
                "offset {at} value {value}: {err:?}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn persisted_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds.cvault");
        let mut store = CredentialStore::create(&path, "pw", fast()).unwrap();
        store.set_entry("5", &[cert()], None).unwrap();
        store.persist().unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn header_roundtrip() {
        let header = VaultHeader::new(fast());
        let parsed = VaultHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.kdf, fast());
        assert_eq!(parsed.salt, header.salt);
        assert_eq!(parsed.nonce, header.nonce);
    }
}
