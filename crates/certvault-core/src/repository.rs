//! Chain accessor and issuer lookup over one credential store file.
//!
//! Every mutation is a full open → mutate → persist cycle under `StoreLock`.
//! Reads open the file without the lock; `persist` replaces the file by
//! rename, so a reader sees either the old store or the new one.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditLog, AuditSeverity};
use crate::certificate::Certificate;
use crate::config::RepositoryConfig;
use crate::credential::{CredentialEntry, IssuerData, PrivateKey};
use crate::error::{RepositoryError, RepositoryResult};
use crate::export::{materialize_temporary, EphemeralExport};
use crate::lock::{SerialLocks, StoreLock};
use crate::vault::CredentialStore;

pub struct CertificateRepository {
    config: RepositoryConfig,
    passphrase: Zeroizing<String>,
    lock: StoreLock,
    serial_locks: SerialLocks,
    audit: Option<AuditLog>,
}

impl CertificateRepository {
    /// Validates `config`, resolves the store passphrase and opens the audit
    /// log if one is configured. The store file itself is opened per call.
    pub fn new(config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        let passphrase = config
            .resolve_passphrase()
            .context("resolve store passphrase")?;
        let audit = match &config.audit_log_path {
            Some(path) => Some(
                AuditLog::new(path, config.audit_log_max_bytes)
                    .with_context(|| format!("open audit log {}", path.display()))?,
            ),
            None => None,
        };
        let lock = StoreLock::new(&config.store_path);
        info!(store = %config.store_path.display(), "certificate repository ready");
        Ok(Self {
            config,
            passphrase,
            lock,
            serial_locks: SerialLocks::default(),
            audit,
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn audit_log(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    pub(crate) fn serial_locks(&self) -> &SerialLocks {
        &self.serial_locks
    }

    fn open_store(&self) -> RepositoryResult<CredentialStore> {
        CredentialStore::open(&self.config.store_path, &self.passphrase, self.config.kdf)
    }

    /// Appends to the audit log when one is configured. Failures are logged
    /// and never fail the operation that produced the record.
    pub(crate) fn audit(&self, event_type: &str, severity: AuditSeverity, data: serde_json::Value) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.append(event_type, severity, data) {
                warn!(event_type, error = %e, "audit append failed");
            }
        }
    }

    /// Files `chain` (leaf first) and the leaf's key under the leaf's serial
    /// number, replacing any existing entry. Returns the serial. A key that
    /// does not belong to the leaf is rejected before anything is written.
    pub fn store(
        &self,
        chain: Vec<Certificate>,
        private_key: Option<PrivateKey>,
    ) -> RepositoryResult<String> {
        let leaf = chain.first().ok_or(RepositoryError::EmptyChain)?;
        let serial = leaf.serial_number()?;
        if let Some(key) = &private_key {
            key.ensure_matches(leaf)?;
        }

        let _guard = self.lock.acquire()?;
        let mut store = self.open_store()?;
        let replaced = store.contains(&serial);
        store.set_entry(&serial, &chain, private_key.as_ref())?;
        store.persist()?;

        info!(
            serial = %serial,
            chain_len = chain.len(),
            with_key = private_key.is_some(),
            replaced,
            "credential entry stored"
        );
        self.audit(
            "ENTRY_STORED",
            AuditSeverity::Info,
            json!({
                "serial": serial,
                "fingerprint": leaf.fingerprint(),
                "chain_len": chain.len(),
                "with_key": private_key.is_some(),
                "replaced": replaced,
            }),
        );
        Ok(serial)
    }

    /// The entry under `serial`, or `None` if there is none. Key material is
    /// only unsealed and attached when `include_private_key` is set.
    pub fn get_chain(
        &self,
        serial: &str,
        include_private_key: bool,
    ) -> RepositoryResult<Option<CredentialEntry>> {
        let store = self.open_store()?;
        let Some(chain) = store.chain(serial)? else {
            debug!(serial = %serial, "no credential entry");
            return Ok(None);
        };
        let private_key = if include_private_key {
            store.private_key(serial)?
        } else {
            None
        };
        Ok(Some(CredentialEntry {
            serial_number: serial.to_string(),
            chain,
            private_key,
        }))
    }

    /// Deletes the entry under `serial`. Returns `false`, without writing,
    /// when there was nothing to delete.
    pub fn remove(&self, serial: &str) -> RepositoryResult<bool> {
        self.remove_matching(serial, None)
    }

    /// Deletes the entry under `serial` only if its leaf still has the given
    /// SHA-256 fingerprint. An entry replaced in the meantime is left alone.
    pub fn remove_if_unchanged(&self, serial: &str, leaf_fingerprint: &str) -> RepositoryResult<bool> {
        self.remove_matching(serial, Some(leaf_fingerprint))
    }

    fn remove_matching(&self, serial: &str, expected: Option<&str>) -> RepositoryResult<bool> {
        let _guard = self.lock.acquire()?;
        let mut store = self.open_store()?;
        let Some(chain) = store.chain(serial)? else {
            debug!(serial = %serial, "remove: no credential entry");
            return Ok(false);
        };
        if let Some(expected) = expected {
            let current = chain.first().map(Certificate::fingerprint);
            if current.as_deref() != Some(expected) {
                warn!(serial = %serial, "entry changed since it was read, not removing");
                return Ok(false);
            }
        }
        store.remove(serial);
        store.persist()?;

        info!(serial = %serial, "credential entry removed");
        self.audit(
            "ENTRY_REMOVED",
            AuditSeverity::Info,
            json!({ "serial": serial }),
        );
        Ok(true)
    }

    /// Signing material for an external signer. `None` for no serial or no
    /// entry; `NotAPrivateKey` when the entry holds no private key.
    pub fn find_issuer(&self, serial: Option<&str>) -> RepositoryResult<Option<IssuerData>> {
        let Some(serial) = serial else {
            return Ok(None);
        };
        let store = self.open_store()?;
        let Some(chain) = store.chain(serial)? else {
            return Ok(None);
        };
        let private_key = store
            .private_key(serial)?
            .ok_or_else(|| RepositoryError::NotAPrivateKey(serial.to_string()))?;
        let leaf = chain
            .first()
            .ok_or_else(|| RepositoryError::corrupt(store.path(), format!("entry {serial} has no certificates")))?;
        let (subject_name, subject_der) = leaf.subject()?;
        Ok(Some(IssuerData {
            private_key,
            subject_name,
            subject_der,
            public_key: leaf.public_key()?,
            serial_number: serial.to_string(),
        }))
    }

    pub fn list_serials(&self) -> RepositoryResult<Vec<String>> {
        Ok(self.open_store()?.serials())
    }

    pub fn contains(&self, serial: &str) -> RepositoryResult<bool> {
        Ok(self.open_store()?.contains(serial))
    }

    /// Writes `entry` to `<export_dir>/<serial>.p12` as a single-entry PKCS#12
    /// keystore under the store passphrase.
    pub fn materialize_temporary(&self, entry: &CredentialEntry) -> RepositoryResult<EphemeralExport> {
        materialize_temporary(entry, &self.config.export_dir, &self.passphrase)
    }
}
