use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::fs_std::FileExt;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

use crate::error::{RepositoryError, RepositoryResult};

/// Single-writer discipline for one store file: an in-process mutex plus an
/// exclusive advisory lock on `<store>.lock`, held for one
/// open → mutate → persist cycle.
#[derive(Debug)]
pub struct StoreLock {
    inner: Mutex<()>,
    lock_path: PathBuf,
}

pub struct StoreGuard<'a> {
    _process: MutexGuard<'a, ()>,
    file: File,
}

impl StoreLock {
    pub fn new(store_path: &Path) -> Self {
        let mut name = store_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        Self {
            inner: Mutex::new(()),
            lock_path: store_path.with_file_name(name),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn acquire(&self) -> RepositoryResult<StoreGuard<'_>> {
        let process = self.inner.lock();
        let access_err = |source| RepositoryError::StoreAccess {
            path: self.lock_path.clone(),
            source,
        };
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(access_err)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(access_err)?;
        FileExt::lock_exclusive(&file).map_err(access_err)?;
        Ok(StoreGuard {
            _process: process,
            file,
        })
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "releasing store file lock failed");
        }
    }
}

/// Async per-serial leases. A lease is held for the whole lifetime of a
/// distribution so two tasks never work on the same entry at once.
#[derive(Debug, Default)]
pub struct SerialLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub struct SerialLease {
    serial: String,
    _guard: OwnedMutexGuard<()>,
}

impl SerialLease {
    pub fn serial(&self) -> &str {
        &self.serial
    }
}

impl SerialLocks {
    pub async fn acquire(&self, serial: &str) -> SerialLease {
        let slot = {
            let mut map = self.inner.lock();
            // drop slots nobody holds or waits on
            map.retain(|_, slot| Arc::strong_count(slot) > 1);
            map.entry(serial.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        SerialLease {
            serial: serial.to_string(),
            _guard: slot.lock_owned().await,
        }
    }

    pub fn tracked(&self) -> usize {
        self.inner.lock().len()
    }
}
