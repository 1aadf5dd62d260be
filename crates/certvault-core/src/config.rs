use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::KdfParams;
use crate::paths::{default_store_path, STORE_FILE_NAME};
use crate::transfer::HostKeyPolicy;

/// Where the store passphrase comes from.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PassphraseSource {
    Inline { value: Zeroizing<String> },
    Env { var: String },
    Keyring { service: String, account: String },
}

impl std::fmt::Debug for PassphraseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassphraseSource::Inline { .. } => f.write_str("Inline(<redacted>)"),
            PassphraseSource::Env { var } => f.debug_struct("Env").field("var", var).finish(),
            PassphraseSource::Keyring { service, account } => f
                .debug_struct("Keyring")
                .field("service", service)
                .field("account", account)
                .finish(),
        }
    }
}

impl PassphraseSource {
    pub fn inline(value: impl Into<String>) -> Self {
        PassphraseSource::Inline {
            value: Zeroizing::new(value.into()),
        }
    }

    pub fn resolve(&self) -> Result<Zeroizing<String>> {
        match self {
            PassphraseSource::Inline { value } => Ok(value.clone()),
            PassphraseSource::Env { var } => std::env::var(var)
                .map(Zeroizing::new)
                .with_context(|| format!("store passphrase variable {var} not set")),
            PassphraseSource::Keyring { service, account } => {
                let entry =
                    Entry::new(service, account).map_err(|e| anyhow!("keyring init: {e}"))?;
                let value = entry
                    .get_password()
                    .map_err(|e| anyhow!("load store passphrase: {e}"))?;
                Ok(Zeroizing::new(value))
            }
        }
    }
}

/// Immutable repository configuration, injected at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub store_path: PathBuf,
    pub passphrase: PassphraseSource,
    pub transfer_username: String,
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    #[serde(default)]
    pub kdf: KdfParams,
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
    #[serde(default = "default_audit_log_max_bytes")]
    pub audit_log_max_bytes: u64,
    #[serde(default = "default_sftp_program")]
    pub sftp_program: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path().unwrap_or_else(|_| PathBuf::from(STORE_FILE_NAME)),
            passphrase: PassphraseSource::Env {
                var: "CERTVAULT_STORE_PASSPHRASE".into(),
            },
            transfer_username: "certvault".into(),
            export_dir: default_export_dir(),
            host_key_policy: HostKeyPolicy::default(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            kdf: KdfParams::default(),
            audit_log_path: None,
            audit_log_max_bytes: default_audit_log_max_bytes(),
            sftp_program: default_sftp_program(),
            identity_file: None,
        }
    }
}

impl RepositoryConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: RepositoryConfig = serde_json::from_slice(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer_username.trim().is_empty() {
            return Err(anyhow!("transfer_username must not be empty"));
        }
        if self.transfer_timeout_secs == 0 {
            return Err(anyhow!("transfer_timeout_secs must be positive"));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(anyhow!("store_path must not be empty"));
        }
        self.kdf.validate().map_err(|e| anyhow!("kdf: {e}"))?;
        Ok(())
    }

    pub fn resolve_passphrase(&self) -> Result<Zeroizing<String>> {
        self.passphrase.resolve()
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

fn default_export_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_transfer_timeout_secs() -> u64 {
    120
}

fn default_audit_log_max_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_sftp_program() -> String {
    "sftp".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_applies_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("certvault.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "store_path": dir.path().join("creds.cvault"),
                "passphrase": {"source": "inline", "value": "s3cret"},
                "transfer_username": "deploy"
            })
            .to_string(),
        )
        .unwrap();
        let config = RepositoryConfig::load(&path).unwrap();
        assert_eq!(config.transfer_username, "deploy");
        assert_eq!(config.export_dir, PathBuf::from("."));
        assert_eq!(config.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.transfer_timeout(), Duration::from_secs(120));
        assert_eq!(config.kdf, KdfParams::default());
        assert_eq!(config.resolve_passphrase().unwrap().as_str(), "s3cret");
    }

    #[test]
    fn rejects_empty_username_and_zero_timeout() {
        let mut config = RepositoryConfig {
            transfer_username: " ".into(),
            ..RepositoryConfig::default()
        };
        assert!(config.validate().is_err());
        config.transfer_username = "deploy".into();
        config.transfer_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.transfer_timeout_secs = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_passphrase_source() {
        std::env::set_var("CERTVAULT_TEST_PASSPHRASE_ENV", "from-env");
        let source = PassphraseSource::Env {
            var: "CERTVAULT_TEST_PASSPHRASE_ENV".into(),
        };
        assert_eq!(source.resolve().unwrap().as_str(), "from-env");
        let missing = PassphraseSource::Env {
            var: "CERTVAULT_TEST_PASSPHRASE_UNSET".into(),
        };
        assert!(missing.resolve().is_err());
    }

    #[test]
    fn debug_redacts_inline_passphrase() {
        let out = format!("{:?}", PassphraseSource::inline("hunter2"));
        assert!(!out.contains("hunter2"));
    }
}
