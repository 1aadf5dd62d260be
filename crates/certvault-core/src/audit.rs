//! Append-only audit trail for repository events. Each line is a JSON record
//! whose hash covers the previous record's hash, so a deleted or edited line
//! breaks the chain.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: AuditSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<ChainState>,
    max_bytes: u64,
}

#[derive(Debug)]
struct ChainState {
    last_seq: u64,
    last_hash: String,
}

impl AuditLog {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(ChainState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for record in Self::read_all(path)? {
            last_seq = record.seq;
            last_hash = record.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn read_all(path: &Path) -> Result<Vec<AuditRecord>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn compute_hash(unhashed: &serde_json::Value) -> String {
        hex::encode(Sha256::digest(unhashed.to_string().as_bytes()))
    }

    fn unhashed_value(
        seq: u64,
        timestamp: &DateTime<Utc>,
        event_type: &str,
        severity: &AuditSeverity,
        data: &serde_json::Value,
        prev_hash: &str,
    ) -> serde_json::Value {
        serde_json::json!({
            "seq": seq,
            "timestamp": timestamp,
            "event_type": event_type,
            "severity": severity,
            "data": data,
            "prev_hash": prev_hash,
        })
    }

    pub fn append(
        &self,
        event_type: &str,
        severity: AuditSeverity,
        data: serde_json::Value,
    ) -> Result<AuditRecord> {
        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;
        let seq = state.last_seq + 1;
        let timestamp = Utc::now();
        let prev_hash = state.last_hash.clone();
        let hash = Self::compute_hash(&Self::unhashed_value(
            seq,
            &timestamp,
            event_type,
            &severity,
            &data,
            &prev_hash,
        ));
        let record = AuditRecord {
            seq,
            timestamp,
            event_type: event_type.to_string(),
            severity,
            data,
            prev_hash,
            hash: hash.clone(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        file.flush()?;
        state.last_seq = seq;
        state.last_hash = hash;
        Ok(record)
    }

    fn rotate_if_needed(&self, state: &mut ChainState) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i)?;
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1)?)?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1)?)?;
        // new file, new chain; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Checks the hash chain of the current file.
    pub fn verify_chain(&self) -> Result<()> {
        let _state = self.inner.lock();
        let mut expected_prev = CHAIN_START.to_string();
        for record in Self::read_all(&self.path)? {
            if record.prev_hash != expected_prev {
                return Err(anyhow!("audit chain broken at seq {}", record.seq));
            }
            let recomputed = Self::compute_hash(&Self::unhashed_value(
                record.seq,
                &record.timestamp,
                &record.event_type,
                &record.severity,
                &record.data,
                &record.prev_hash,
            ));
            if recomputed != record.hash {
                return Err(anyhow!("audit record {} hash mismatch", record.seq));
            }
            expected_prev = record.hash;
        }
        Ok(())
    }

    /// Most recent first.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditRecord>> {
        let mut records: Vec<AuditRecord> = Self::read_all(&self.path)?
            .into_iter()
            .filter(|r| since.map_or(true, |ts| r.timestamp >= ts))
            .collect();
        records.reverse();
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn path_with_suffix(&self, index: usize) -> Result<PathBuf> {
        let filename = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("audit log path has no file name"))?
            .to_string_lossy()
            .to_string();
        Ok(self.path.with_file_name(format!("{filename}.{index}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_verifies_and_rotates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::new(&path, 512).unwrap();
        for i in 0..40 {
            let record = log
                .append("ENTRY_STORED", AuditSeverity::Info, serde_json::json!({"i": i}))
                .unwrap();
            assert_eq!(record.seq as usize, i + 1);
        }
        assert!(path.with_file_name("audit.log.1").exists());
        log.verify_chain().unwrap();
    }

    #[test]
    fn tampering_breaks_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::new(&path, 1 << 20).unwrap();
        log.append("A", AuditSeverity::Info, serde_json::json!({"serial": "1"}))
            .unwrap();
        log.append("B", AuditSeverity::Warn, serde_json::json!({"serial": "2"}))
            .unwrap();
        log.verify_chain().unwrap();

        let text = fs::read_to_string(&path).unwrap().replace("\"2\"", "\"3\"");
        fs::write(&path, text).unwrap();
        assert!(log.verify_chain().is_err());
    }

    #[test]
    fn reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let log = AuditLog::new(&path, 1 << 20).unwrap();
            log.append("A", AuditSeverity::Info, serde_json::json!({})).unwrap();
        }
        let log = AuditLog::new(&path, 1 << 20).unwrap();
        let record = log.append("B", AuditSeverity::Info, serde_json::json!({})).unwrap();
        assert_eq!(record.seq, 2);
        log.verify_chain().unwrap();
        let recent = log.read_recent(None, Some(1)).unwrap();
        assert_eq!(recent[0].event_type, "B");
    }
}
