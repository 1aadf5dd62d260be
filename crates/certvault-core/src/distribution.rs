//! Distribution orchestrator.
//!
//! `distribute` exports one entry to a temporary PKCS#12 file, uploads it
//! over the transfer seam, and retires the local entry when its leaf is an
//! end-entity certificate. CA and indeterminate entries are kept. The
//! temporary file is gone before the task finishes, whatever happened.
//!
//! Each run holds the serial's lease for its whole lifetime, reports every
//! stage on a broadcast channel, and appends its outcome to the audit log.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::AuditSeverity;
use crate::certificate::{classify, Certificate, CertificateKind};
use crate::error::{RepositoryError, RepositoryResult, TransferError};
use crate::export::EphemeralExport;
use crate::repository::CertificateRepository;
use crate::transfer::{SftpCommandConnector, TransferConnector};

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionStage {
    Started,
    Exported,
    Transferred,
    Classified(CertificateKind),
    Removed,
    Kept,
    CleanedUp,
    Done(DistributionOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DistributionOutcome {
    /// Transferred, and the end-entity entry was deleted locally.
    Removed,
    /// Transferred; the entry stays because of its classification.
    Kept { kind: CertificateKind },
    /// Transferred, but the entry was replaced or deleted while the upload
    /// ran, so nothing was removed.
    Superseded,
    /// No entry under the serial.
    NotFound,
    Failed { reason: String },
}

impl DistributionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DistributionOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct DistributionEvent {
    pub id: Uuid,
    pub serial: String,
    pub hostname: String,
    pub stage: DistributionStage,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DistributionReport {
    pub id: Uuid,
    pub serial: String,
    pub hostname: String,
    pub destination: String,
    pub outcome: DistributionOutcome,
    /// False only if deleting the temporary file failed; see the logs.
    pub cleaned_up: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// A running distribution. Dropping the handle detaches the task; it still
/// runs to completion.
#[derive(Debug)]
pub struct DistributionHandle {
    id: Uuid,
    serial: String,
    task: JoinHandle<DistributionReport>,
}

impl DistributionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> RepositoryResult<DistributionReport> {
        self.task
            .await
            .map_err(|e| RepositoryError::Task(e.to_string()))
    }
}

// ── Distributor ─────────────────────────────────────────────────────────────

pub struct Distributor {
    repo: Arc<CertificateRepository>,
    connector: Arc<dyn TransferConnector>,
    events: broadcast::Sender<DistributionEvent>,
    runtime: Option<Handle>,
}

impl Distributor {
    /// Jobs run on the tokio runtime current at construction, if any. Use
    /// `with_runtime` when constructing from outside one.
    pub fn new(repo: Arc<CertificateRepository>, connector: Arc<dyn TransferConnector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            repo,
            connector,
            events,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Transfers through the system `sftp` client named in the configuration.
    pub fn with_sftp(repo: Arc<CertificateRepository>) -> Self {
        let config = repo.config();
        let connector =
            SftpCommandConnector::new(config.sftp_program.clone(), config.identity_file.clone());
        Self::new(repo, Arc::new(connector))
    }

    pub fn repository(&self) -> &Arc<CertificateRepository> {
        &self.repo
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DistributionEvent> {
        self.events.subscribe()
    }

    /// Starts distributing `serial` to `hostname:destination` and returns at
    /// once. Callable from any thread; fails with `Task` only when the
    /// distributor has no runtime to run on.
    pub fn distribute(
        &self,
        serial: &str,
        hostname: &str,
        destination: &str,
    ) -> RepositoryResult<DistributionHandle> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| RepositoryError::Task("no tokio runtime to run distribution on".into()))?;
        let job = Job {
            id: Uuid::new_v4(),
            serial: serial.to_string(),
            hostname: hostname.to_string(),
            destination: destination.to_string(),
            repo: self.repo.clone(),
            connector: self.connector.clone(),
            events: self.events.clone(),
        };
        let id = job.id;
        info!(%id, serial = %serial, host = %hostname, destination = %destination, "distribution scheduled");
        Ok(DistributionHandle {
            id,
            serial: serial.to_string(),
            task: runtime.spawn(job.run()),
        })
    }
}

// ── Job ─────────────────────────────────────────────────────────────────────

struct Job {
    id: Uuid,
    serial: String,
    hostname: String,
    destination: String,
    repo: Arc<CertificateRepository>,
    connector: Arc<dyn TransferConnector>,
    events: broadcast::Sender<DistributionEvent>,
}

impl Job {
    async fn run(self) -> DistributionReport {
        let started_at = Utc::now();
        let _lease = self.repo.serial_locks().acquire(&self.serial).await;
        self.emit(DistributionStage::Started);

        let (outcome, cleaned_up) = match self.export().await {
            Ok(None) => {
                warn!(id = %self.id, serial = %self.serial, "no credential entry to distribute");
                (DistributionOutcome::NotFound, true)
            }
            Ok(Some((export, leaf))) => {
                self.emit(DistributionStage::Exported);
                let outcome = self.deliver(&export, leaf).await;
                (outcome, export.cleanup())
            }
            Err(e) => (
                DistributionOutcome::Failed {
                    reason: format!("export: {e}"),
                },
                true,
            ),
        };
        self.emit(DistributionStage::CleanedUp);
        self.finish(&outcome);
        self.emit(DistributionStage::Done(outcome.clone()));

        DistributionReport {
            id: self.id,
            serial: self.serial,
            hostname: self.hostname,
            destination: self.destination,
            outcome,
            cleaned_up,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Reads the entry with its key and writes the temporary PKCS#12 file.
    async fn export(&self) -> RepositoryResult<Option<(EphemeralExport, Certificate)>> {
        let repo = self.repo.clone();
        let serial = self.serial.clone();
        tokio::task::spawn_blocking(move || -> RepositoryResult<_> {
            let Some(entry) = repo.get_chain(&serial, true)? else {
                return Ok(None);
            };
            let leaf = entry.leaf().cloned().ok_or(RepositoryError::EmptyChain)?;
            let export = repo.materialize_temporary(&entry)?;
            Ok(Some((export, leaf)))
        })
        .await
        .map_err(|e| RepositoryError::Task(e.to_string()))?
    }

    async fn deliver(&self, export: &EphemeralExport, leaf: Certificate) -> DistributionOutcome {
        if let Err(e) = self.transfer(export.path()).await {
            error!(id = %self.id, serial = %self.serial, host = %self.hostname, error = %e, "transfer failed");
            return DistributionOutcome::Failed {
                reason: format!("transfer: {e}"),
            };
        }
        self.emit(DistributionStage::Transferred);
        self.retire(leaf).await
    }

    /// connect → authenticate → upload, bounded by the configured timeout.
    async fn transfer(&self, local: &Path) -> Result<(), TransferError> {
        let config = self.repo.config();
        let limit = config.transfer_timeout();
        let attempt = async {
            let mut session = self
                .connector
                .connect(&self.hostname, config.host_key_policy)
                .await?;
            session.authenticate(&config.transfer_username).await?;
            session.upload(local, &self.destination).await?;
            // the file has arrived; a failed close does not undo that
            if let Err(e) = session.close().await {
                warn!(id = %self.id, host = %self.hostname, error = %e, "closing transfer session failed");
            }
            Ok::<(), TransferError>(())
        };
        tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| TransferError::Timeout(limit))?
    }

    /// Deletes the local entry if, and only if, its leaf is an end-entity
    /// certificate that has not been replaced since export.
    async fn retire(&self, leaf: Certificate) -> DistributionOutcome {
        let kind = classify(&leaf);
        self.emit(DistributionStage::Classified(kind));
        match kind {
            CertificateKind::EndEntity => {}
            CertificateKind::Ca => {
                debug!(id = %self.id, serial = %self.serial, "CA certificate kept");
                self.emit(DistributionStage::Kept);
                return DistributionOutcome::Kept { kind };
            }
            CertificateKind::Indeterminate(reason) => {
                warn!(
                    id = %self.id,
                    serial = %self.serial,
                    ?reason,
                    "cannot tell CA from end-entity, keeping entry"
                );
                self.emit(DistributionStage::Kept);
                return DistributionOutcome::Kept { kind };
            }
        }

        let repo = self.repo.clone();
        let serial = self.serial.clone();
        let fingerprint = leaf.fingerprint();
        let removed = tokio::task::spawn_blocking(move || {
            repo.remove_if_unchanged(&serial, &fingerprint)
        })
        .await
        .map_err(|e| RepositoryError::Task(e.to_string()))
        .and_then(|r| r);
        match removed {
            Ok(true) => {
                self.emit(DistributionStage::Removed);
                DistributionOutcome::Removed
            }
            Ok(false) => {
                self.emit(DistributionStage::Kept);
                DistributionOutcome::Superseded
            }
            Err(e) => {
                error!(id = %self.id, serial = %self.serial, error = %e, "removing distributed entry failed");
                DistributionOutcome::Failed {
                    reason: format!("remove: {e}"),
                }
            }
        }
    }

    fn emit(&self, stage: DistributionStage) {
        debug!(id = %self.id, serial = %self.serial, ?stage, "distribution stage");
        // no subscribers is fine
        let _ = self.events.send(DistributionEvent {
            id: self.id,
            serial: self.serial.clone(),
            hostname: self.hostname.clone(),
            stage,
            at: Utc::now(),
        });
    }

    fn finish(&self, outcome: &DistributionOutcome) {
        let (event_type, severity) = match outcome {
            DistributionOutcome::Failed { .. } => ("DISTRIBUTION_FAILED", AuditSeverity::Error),
            DistributionOutcome::NotFound => ("DISTRIBUTION_NOT_FOUND", AuditSeverity::Warn),
            _ => ("DISTRIBUTION_COMPLETED", AuditSeverity::Info),
        };
        if outcome.is_failure() {
            warn!(id = %self.id, serial = %self.serial, ?outcome, "distribution failed");
        } else {
            info!(id = %self.id, serial = %self.serial, ?outcome, "distribution finished");
        }
        self.repo.audit(
            event_type,
            severity,
            json!({
                "id": self.id,
                "serial": self.serial,
                "hostname": self.hostname,
                "destination": self.destination,
                "result": outcome,
            }),
        );
    }
}
