//! batchctl - batch task runner
//!
//! Runs one function over a list of argument tuples, serially or on a
//! bounded worker pool, and always answers in input order. Two wrappers add
//! durable control on top: [`FileGate`] skips files that have not changed
//! since they last succeeded, and [`SessionRunner`] resumes interrupted
//! batches from a per-session ledger.

pub mod core;
pub mod error;
pub mod events;
pub mod gate;
pub mod ledger;
pub mod session;
pub mod settings;

// Re-exports
pub use crate::core::{
    CommandSpec, ConfigError, CoreRunner, ParallelMode, RunnerConfig, Task, TaskFunction,
    TaskResult,
};
pub use error::{Error, Result};
pub use events::{EventStream, LogObserver, NullObserver, Observer, RunEvent};
pub use gate::FileGate;
pub use ledger::{Ledger, LedgerError, LedgerRecord, LedgerStatus};
pub use session::{FailurePolicy, SessionReport, SessionRunner};
pub use settings::RunnerSettings;
