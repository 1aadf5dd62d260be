//! certvault-core - certificate and private-key repository
//!
//! Keeps X.509 chains and their private keys in one encrypted store file,
//! hands signing material to an external signer, and distributes entries to
//! remote hosts over SFTP, retiring end-entity material once it has shipped.
//!
//! # Module layout
//! - `vault`        : store file format: Argon2id + XChaCha20-Poly1305, atomic rewrite
//! - `certificate`  : DER wrapper and CA / end-entity classification
//! - `credential`   : entry, private key and issuer data types
//! - `repository`   : store / get_chain / remove / find_issuer
//! - `export`       : ephemeral single-entry PKCS#12 files
//! - `distribution` : async export → transfer → retire orchestration
//! - `transfer`     : transfer seam and the `sftp` command implementation
//! - `lock`         : store file lock and per-serial leases
//! - `audit`        : hash-chained audit log
//! - `config`, `paths`, `crypto`, `error`

pub mod audit;
pub mod certificate;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod distribution;
pub mod error;
pub mod export;
pub mod lock;
pub mod paths;
pub mod repository;
pub mod transfer;
pub mod vault;

pub use certificate::{classify, Certificate, CertificateKind, IndeterminateReason};
pub use config::{PassphraseSource, RepositoryConfig};
pub use credential::{CredentialEntry, IssuerData, PrivateKey};
pub use distribution::{
    DistributionEvent, DistributionHandle, DistributionOutcome, DistributionReport,
    DistributionStage, Distributor,
};
pub use error::{RepositoryError, RepositoryResult, TransferError};
pub use export::EphemeralExport;
pub use repository::CertificateRepository;
pub use transfer::{HostKeyPolicy, SftpCommandConnector, TransferConnector, TransferSession};
