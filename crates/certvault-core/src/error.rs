use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the synchronous repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("cannot access credential store {path}: {source}")]
    StoreAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential store {path} is corrupt or the passphrase is wrong: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("cannot write credential store {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("entry {0} does not hold a private key")]
    NotAPrivateKey(String),

    #[error("private key is not usable PKCS#8: {0}")]
    InvalidPrivateKey(String),

    #[error("private key does not belong to certificate {0}")]
    KeyMismatch(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("certificate chain is empty")]
    EmptyChain,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl RepositoryError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RepositoryError::StoreCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Failures of the secure-transfer step.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("connect to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("public-key authentication as {username} failed: {reason}")]
    Authentication { username: String, reason: String },

    #[error("upload to {remote} failed: {reason}")]
    Upload { remote: String, reason: String },

    #[error("transfer timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transfer io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;
