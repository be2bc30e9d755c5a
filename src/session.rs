//! Session runner - resumable batches keyed by session id
//!
//! Each session owns a ledger at `<ledger_dir>/<session_id>.session`. Every
//! task start and finish is written before the next completion is handled,
//! so a run that dies part way leaves an accurate record of what finished.

use crate::core::{CoreRunner, Planned, Progress, Task, TaskResult};
use crate::error::{Error, Result};
use crate::events::RunEvent;
use crate::ledger::{self, Ledger, LedgerError, LedgerRecord, LedgerStatus, SESSION_EXT};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What a controlled run does with tasks recorded as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Run them again
    #[default]
    Retry,
    /// Report the recorded failure without running
    Skip,
}

/// Results of one session run
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    /// `(task_id, result)` in input order
    pub results: Vec<(String, TaskResult)>,
}

impl SessionReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.skipped).count()
    }
}

pub struct SessionRunner {
    runner: CoreRunner,
    ledger_dir: PathBuf,
    failure_policy: FailurePolicy,
}

impl SessionRunner {
    pub fn new(runner: CoreRunner, ledger_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            ledger_dir: ledger_dir.into(),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn runner(&self) -> &CoreRunner {
        &self.runner
    }

    pub fn ledger_dir(&self) -> &Path {
        &self.ledger_dir
    }

    /// New session id: UTC timestamp plus a random suffix
    pub fn generate_session_id() -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "session_{}_{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &suffix[..8]
        )
    }

    /// Ledger key of a task, stable across runs
    pub fn task_id(task: &Task) -> String {
        format!("task_{}", task.fingerprint())
    }

    /// Run a batch under a session.
    ///
    /// Without `session_id` a new session is started; its id is in the
    /// report. Controlled runs skip tasks the session already completed.
    /// Both kinds of run keep the ledger current.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        session_id: Option<&str>,
        controlled: bool,
    ) -> Result<SessionReport> {
        let session_id = match session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.to_string()
            }
            None => Self::generate_session_id(),
        };

        let mut ledger = Ledger::open(Ledger::session_path(&self.ledger_dir, &session_id))
            .map_err(Error::LedgerRead)?;
        let observer = self.runner.observer().clone();
        let keys: Vec<String> = tasks.iter().map(Self::task_id).collect();

        let mut plan = Vec::with_capacity(tasks.len());
        for (task, key) in tasks.into_iter().zip(&keys) {
            let skip = if controlled {
                ledger
                    .get(key)
                    .and_then(|record| self.skip_reason(record).map(|reason| (record, reason)))
            } else {
                None
            };
            plan.push(match skip {
                Some((record, reason)) => Planned::Skip {
                    key: key.clone(),
                    reason: reason.to_string(),
                    result: record.to_result(),
                },
                None => Planned::Run(task),
            });
        }

        let mut persist_error: Option<LedgerError> = None;
        let results = self
            .runner
            .run_with(plan, |progress| {
                // One failed write means the ledger can no longer be trusted
                if persist_error.is_some() {
                    return;
                }
                let (key, outcome) = match progress {
                    Progress::Started(index) => {
                        let key = &keys[index];
                        (key, ledger.begin(key).map(|_| LedgerStatus::Running))
                    }
                    Progress::Finished(index, result) => {
                        let key = &keys[index];
                        (key, ledger.finish(key, result))
                    }
                };
                match outcome {
                    Ok(status) => observer.observe(&RunEvent::LedgerUpdated {
                        key: key.clone(),
                        status,
                    }),
                    Err(e) => {
                        observer.observe(&RunEvent::LedgerWriteFailed {
                            path: ledger.path().display().to_string(),
                            error: e.to_string(),
                        });
                        persist_error = Some(e);
                    }
                }
            })
            .await;

        let report = SessionReport {
            session_id,
            results: keys.into_iter().zip(results).collect(),
        };

        match persist_error {
            Some(source) => Err(Error::SessionNotPersisted {
                source,
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }

    /// Read a session's ledger
    pub fn load_session(&self, session_id: &str) -> Result<Ledger> {
        validate_session_id(session_id)?;
        Ledger::open(Ledger::session_path(&self.ledger_dir, session_id)).map_err(Error::LedgerRead)
    }

    /// Ids of every session in the ledger directory, newest first
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.ledger_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(Error::ListSessions {
                    dir: self.ledger_dir.clone(),
                    source,
                })
            }
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| Error::ListSessions {
                    dir: self.ledger_dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|s| s.to_str()) == Some(SESSION_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    sessions.push(stem.to_string());
                }
            }
        }

        sessions.sort();
        sessions.reverse(); // Most recent first
        Ok(sessions)
    }

    fn skip_reason(&self, record: &LedgerRecord) -> Option<&'static str> {
        match (record.status, self.failure_policy) {
            (LedgerStatus::CompletedSuccess, _) => Some("completed earlier in this session"),
            (LedgerStatus::CompletedFailure, FailurePolicy::Skip) => {
                Some("failed earlier in this session and retries are off")
            }
            _ => None,
        }
    }
}

fn validate_session_id(id: &str) -> Result<()> {
    if !ledger::is_valid_name(id) {
        return Err(Error::InvalidSessionId(id.to_string()));
    }
    Ok(())
}
