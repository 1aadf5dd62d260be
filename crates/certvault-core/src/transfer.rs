//! Secure file transfer seam.
//!
//! The orchestrator only needs "connect, authenticate by public key, upload a
//! file". `TransferConnector` / `TransferSession` capture that; the shipped
//! implementation drives the system `sftp` client in batch mode.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::TransferError;

/// How the remote host's identity is checked. Chosen by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Host must already be in known_hosts.
    #[default]
    Strict,
    /// Accept any host key.
    Permissive,
}

#[async_trait]
pub trait TransferConnector: Send + Sync {
    async fn connect(
        &self,
        hostname: &str,
        policy: HostKeyPolicy,
    ) -> Result<Box<dyn TransferSession>, TransferError>;
}

#[async_trait]
pub trait TransferSession: Send {
    async fn authenticate(&mut self, username: &str) -> Result<(), TransferError>;

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransferError>;

    async fn close(&mut self) -> Result<(), TransferError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SftpCommandConnector {
    program: String,
    identity_file: Option<PathBuf>,
}

impl SftpCommandConnector {
    pub fn new(program: impl Into<String>, identity_file: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            identity_file,
        }
    }
}

#[async_trait]
impl TransferConnector for SftpCommandConnector {
    async fn connect(
        &self,
        hostname: &str,
        policy: HostKeyPolicy,
    ) -> Result<Box<dyn TransferSession>, TransferError> {
        if !is_safe_token(hostname) {
            return Err(TransferError::Connect {
                host: hostname.to_string(),
                reason: "invalid hostname".into(),
            });
        }
        Ok(Box::new(SftpCommandSession {
            program: self.program.clone(),
            identity_file: self.identity_file.clone(),
            host: hostname.to_string(),
            policy,
            username: None,
        }))
    }
}

/// One `sftp` invocation per upload. The ssh handshake and public-key
/// authentication happen inside the child process.
#[derive(Debug)]
pub struct SftpCommandSession {
    program: String,
    identity_file: Option<PathBuf>,
    host: String,
    policy: HostKeyPolicy,
    username: Option<String>,
}

impl SftpCommandSession {
    fn args(&self, username: &str) -> Vec<String> {
        let mut args = vec![
            "-b".to_string(),
            "-".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "PreferredAuthentications=publickey".to_string(),
        ];
        match self.policy {
            HostKeyPolicy::Strict => {
                args.push("-o".into());
                args.push("StrictHostKeyChecking=yes".into());
            }
            HostKeyPolicy::Permissive => {
                args.push("-o".into());
                args.push("StrictHostKeyChecking=no".into());
                args.push("-o".into());
                args.push("UserKnownHostsFile=/dev/null".into());
            }
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".into());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", username, self.host));
        args
    }
}

#[async_trait]
impl TransferSession for SftpCommandSession {
    async fn authenticate(&mut self, username: &str) -> Result<(), TransferError> {
        if !is_safe_token(username) || username.contains('@') {
            return Err(TransferError::Authentication {
                username: username.to_string(),
                reason: "invalid username".into(),
            });
        }
        self.username = Some(username.to_string());
        Ok(())
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransferError> {
        let username = self
            .username
            .clone()
            .ok_or_else(|| TransferError::Authentication {
                username: String::new(),
                reason: "upload before authenticate".into(),
            })?;
        let local_str = local.display().to_string();
        if !is_quotable(&local_str) || !is_quotable(remote) {
            return Err(TransferError::Upload {
                remote: remote.to_string(),
                reason: "path cannot be quoted for sftp batch mode".into(),
            });
        }
        let batch = format!("put \"{local_str}\" \"{remote}\"\n");
        debug!(host = %self.host, remote = %remote, "starting sftp upload");

        let mut child = Command::new(&self.program)
            .args(self.args(&username))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(batch.as_bytes()).await {
                Ok(()) => {}
                // child exited before reading its batch; the exit status says why
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(TransferError::Upload {
                remote: format!("{}:{}", self.host, remote),
                reason: format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        info!(host = %self.host, remote = %remote, "sftp upload complete");
        Ok(())
    }
}

fn is_safe_token(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && !value.chars().any(|c| c.is_whitespace() || c.is_control())
}

fn is_quotable(value: &str) -> bool {
    !value.is_empty() && !value.chars().any(|c| c == '"' || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_option_like_hostname() {
        let connector = SftpCommandConnector::new("sftp", None);
        let err = connector
            .connect("-oProxyCommand=evil", HostKeyPolicy::Strict)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Connect { .. }));
    }

    #[tokio::test]
    async fn upload_requires_authentication() {
        let connector = SftpCommandConnector::new("true", None);
        let mut session = connector
            .connect("host.example", HostKeyPolicy::Strict)
            .await
            .unwrap();
        let err = session
            .upload(Path::new("1001.p12"), "/incoming")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Authentication { .. }));
        assert!(session.authenticate("bad user").await.is_err());
    }

    #[test]
    fn permissive_policy_disables_host_key_checks() {
        let session = SftpCommandSession {
            program: "sftp".into(),
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
            host: "host.example".into(),
            policy: HostKeyPolicy::Permissive,
            username: None,
        };
        let args = session.args("deploy");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"/keys/id_ed25519".to_string()));
        assert_eq!(args.last().unwrap(), "deploy@host.example");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program_is_upload_error() {
        let connector = SftpCommandConnector::new("false", None);
        let mut session = connector
            .connect("host.example", HostKeyPolicy::Strict)
            .await
            .unwrap();
        session.authenticate("deploy").await.unwrap();
        let err = session
            .upload(Path::new("1001.p12"), "/incoming")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Upload { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_program_is_ok() {
        let connector = SftpCommandConnector::new("true", None);
        let mut session = connector
            .connect("host.example", HostKeyPolicy::Strict)
            .await
            .unwrap();
        session.authenticate("deploy").await.unwrap();
        session
            .upload(Path::new("1001.p12"), "/incoming")
            .await
            .unwrap();
        session.close().await.unwrap();
    }
}
