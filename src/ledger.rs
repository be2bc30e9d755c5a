//! Ledger - durable key to record store behind file gating and sessions
//!
//! One JSON document per ledger, mapping each key to its latest record.
//! Every write replaces one record in memory and then swaps the whole
//! document in with a temp file and an atomic rename, so readers only ever
//! see complete files. Writers in separate processes are not coordinated.

use crate::core::TaskResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Extension of session ledgers
pub const SESSION_EXT: &str = "session";
/// Extension of file gate ledgers
pub const FILECONTROL_EXT: &str = "filecontrol";

/// Whether `name` can be used as a ledger file stem: a single, non-empty
/// path component
pub fn is_valid_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['/', '\\', '\0']) && !name.contains("..")
}

/// Progress of one ledger key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Running,
    CompletedSuccess,
    CompletedFailure,
}

impl LedgerStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::CompletedSuccess | Self::CompletedFailure)
    }

    /// Records only move forward; a completed key may start a new attempt
    /// but never returns to pending.
    pub fn can_advance_to(&self, next: LedgerStatus) -> bool {
        next != Self::Pending || *self == Self::Pending
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::CompletedSuccess => write!(f, "completed_success"),
            Self::CompletedFailure => write!(f, "completed_failure"),
        }
    }
}

/// Latest known state of one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub status: LedgerStatus,
    pub timestamp: DateTime<Utc>,
    /// Value of the last successful run
    #[serde(default)]
    pub summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl LedgerRecord {
    pub fn new(status: LedgerStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            status,
            timestamp,
            summary: None,
            error: None,
            attempts: 0,
        }
    }

    /// Rebuild the result this record stands for, marked as skipped
    pub fn to_result(&self) -> TaskResult {
        let result = match self.status {
            LedgerStatus::CompletedSuccess => {
                TaskResult::success(self.summary.clone().unwrap_or(Value::Null))
            }
            _ => TaskResult::failure(
                self.error
                    .clone()
                    .unwrap_or_else(|| format!("recorded as {}", self.status)),
            ),
        };
        result.into_skipped()
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read ledger {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("ledger {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write ledger {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("ledger key {key} cannot move from {from} to {to}")]
    InvalidTransition {
        key: String,
        from: LedgerStatus,
        to: LedgerStatus,
    },
}

/// A loaded ledger bound to its file
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    records: BTreeMap<String, LedgerRecord>,
}

impl Ledger {
    /// Ledger file of a session
    pub fn session_path(dir: &Path, session_id: &str) -> PathBuf {
        dir.join(format!("{}.{}", session_id, SESSION_EXT))
    }

    /// Ledger file of a file gate context
    pub fn filecontrol_path(dir: &Path, context: &str) -> PathBuf {
        dir.join(format!("{}.{}", context, FILECONTROL_EXT))
    }

    /// Read the whole ledger; a missing or empty file is an empty ledger.
    /// Nothing is created until the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                records: BTreeMap::new(),
            });
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(source) => return Err(LedgerError::Read { path, source }),
        };
        let records = if content.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&content).map_err(|source| LedgerError::Corrupt {
                path: path.clone(),
                source,
            })?
        };
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&LedgerRecord> {
        self.records.get(key)
    }

    pub fn records(&self) -> &BTreeMap<String, LedgerRecord> {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or replace one record and persist the ledger
    pub fn put(&mut self, key: &str, record: LedgerRecord) -> Result<(), LedgerError> {
        if let Some(current) = self.records.get(key) {
            if !current.status.can_advance_to(record.status) {
                return Err(LedgerError::InvalidTransition {
                    key: key.to_string(),
                    from: current.status,
                    to: record.status,
                });
            }
        }

        let previous = self.records.insert(key.to_string(), record);
        if let Err(e) = self.save() {
            // Keep memory in line with what is on disk
            match previous {
                Some(prev) => self.records.insert(key.to_string(), prev),
                None => self.records.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Record that a new attempt of `key` has started
    pub fn begin(&mut self, key: &str) -> Result<(), LedgerError> {
        let attempts = self.get(key).map(|r| r.attempts).unwrap_or(0) + 1;
        let mut record = LedgerRecord::new(LedgerStatus::Running, Utc::now());
        record.attempts = attempts;
        self.put(key, record)
    }

    /// Record the outcome of the current attempt of `key`
    pub fn finish(&mut self, key: &str, result: &TaskResult) -> Result<LedgerStatus, LedgerError> {
        let status = if result.success {
            LedgerStatus::CompletedSuccess
        } else {
            LedgerStatus::CompletedFailure
        };
        let attempts = self.get(key).map(|r| r.attempts).unwrap_or(0).max(1);
        let record = LedgerRecord {
            status,
            timestamp: Utc::now(),
            summary: result.value.clone(),
            error: result.error.clone(),
            attempts,
        };
        self.put(key, record)?;
        Ok(status)
    }

    fn save(&self) -> Result<(), LedgerError> {
        let write_err = |source: io::Error| LedgerError::Write {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(&self.records)
            .map_err(|e| write_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        blocking(|| write_atomic(&self.path, &json)).map_err(write_err)
    }
}

/// Replace `path` with `contents` through a synced temp file in the same directory
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Run blocking file I/O, handing the worker's other tasks to another thread
/// when called from a multi-threaded runtime. `block_in_place` panics on a
/// current-thread runtime, where the call just runs inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
