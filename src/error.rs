//! Errors surfaced by controlled runs

use crate::core::{ConfigError, TaskResult};
use crate::ledger::LedgerError;
use crate::session::SessionReport;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid runner configuration: {0}")]
    Config(#[from] ConfigError),

    /// The ledger could not be read, so skipping decisions are unsafe
    #[error("cannot resume: {0}")]
    LedgerRead(#[source] LedgerError),

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("invalid file control context '{0}'")]
    InvalidContext(String),

    #[error("failed to list sessions in {}: {source}", .dir.display())]
    ListSessions {
        dir: PathBuf,
        source: std::io::Error,
    },

    /// Every task ran, but progress stopped being recorded part way
    #[error("session {} ran but was not fully recorded: {source}", .report.session_id)]
    SessionNotPersisted {
        #[source]
        source: LedgerError,
        report: Box<SessionReport>,
    },

    /// Every file was processed, but some successes were not recorded
    #[error("file batch ran but was not fully recorded: {source}")]
    FilesNotPersisted {
        #[source]
        source: LedgerError,
        results: Vec<(PathBuf, TaskResult)>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
