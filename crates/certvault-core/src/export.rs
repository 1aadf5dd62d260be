//! Ephemeral PKCS#12 exports.
//!
//! The file handed to the transfer step is a standard PKCS#12 keystore, so the
//! receiving host can load it with any PKCS#12 reader. The entry is filed under
//! its serial number as alias.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use p12_keystore::{Certificate as P12Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::credential::CredentialEntry;
use crate::error::{RepositoryError, RepositoryResult};
use crate::paths::export_path;

/// A single-entry PKCS#12 file written for one transfer. The file is deleted by
/// `cleanup`, or on drop if `cleanup` was never called.
#[derive(Debug)]
pub struct EphemeralExport {
    path: PathBuf,
    serial: String,
    removed: bool,
}

impl EphemeralExport {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Deletes the file. Failures are logged and reported as `false`, never
    /// raised.
    pub fn cleanup(mut self) -> bool {
        self.remove_file()
    }

    fn remove_file(&mut self) -> bool {
        if self.removed {
            return true;
        }
        self.removed = true;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "ephemeral export removed");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    serial = %self.serial,
                    error = %e,
                    "failed to remove ephemeral export"
                );
                false
            }
        }
    }
}

impl Drop for EphemeralExport {
    fn drop(&mut self) {
        self.remove_file();
    }
}

/// Writes `entry` as the only entry of a new PKCS#12 keystore at
/// `<dir>/<serial>.p12`, protected by `passphrase`.
pub fn materialize_temporary(
    entry: &CredentialEntry,
    dir: &Path,
    passphrase: &str,
) -> RepositoryResult<EphemeralExport> {
    let serial = entry.serial_number.as_str();
    if serial.is_empty() || !serial.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RepositoryError::InvalidCertificate(format!(
            "serial {serial:?} is not a decimal serial number"
        )));
    }
    let key = entry
        .private_key
        .as_ref()
        .ok_or_else(|| RepositoryError::NotAPrivateKey(serial.to_string()))?;
    let leaf = entry.leaf().ok_or(RepositoryError::EmptyChain)?;

    let chain = entry
        .chain
        .iter()
        .map(|c| {
            P12Certificate::from_der(c.der())
                .map_err(|e| RepositoryError::InvalidCertificate(format!("pkcs12 chain: {e}")))
        })
        .collect::<RepositoryResult<Vec<_>>>()?;
    // local key id ties the key bag to the leaf certificate bag
    let local_key_id = Sha256::digest(leaf.der())[..20].to_vec();
    let mut keystore = KeyStore::new();
    keystore.add_entry(
        serial,
        KeyStoreEntry::PrivateKeyChain(PrivateKeyChain::new(key.pkcs8_der(), local_key_id, chain)),
    );
    let der = Zeroizing::new(
        keystore
            .writer(passphrase)
            .write()
            .map_err(|e| RepositoryError::Crypto(format!("pkcs12 encode: {e}")))?,
    );

    let path = export_path(dir, serial);
    write_owner_only(&path, &der)?;
    debug!(path = %path.display(), serial = %serial, "ephemeral export written");
    Ok(EphemeralExport {
        path,
        serial: serial.to_string(),
        removed: false,
    })
}

/// Stages `bytes` in `path`'s directory and renames it into place. The staged
/// file is created with mode 0600 on Unix; a stale export is replaced.
fn write_owner_only(path: &Path, bytes: &[u8]) -> RepositoryResult<()> {
    let write_err = |source| RepositoryError::StoreWrite {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(write_err)?;
    let mut staging = NamedTempFile::new_in(&dir).map_err(write_err)?;
    staging.write_all(bytes).map_err(write_err)?;
    staging.as_file().sync_all().map_err(write_err)?;
    staging.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
