//! Run events and the observers that consume them
//!
//! Runners never log through a global; they report to the observer they were
//! built with. `LogObserver` forwards to the `log` facade, `EventStream`
//! fans events out to any number of subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::ParallelMode;
use crate::ledger::LedgerStatus;

/// Events emitted while a batch runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A batch was submitted to the runner
    RunStarted {
        total: usize,
        parallel: bool,
        mode: ParallelMode,
        workers: usize,
    },
    /// A task acquired a worker slot. Indices are positions in the
    /// submitted batch.
    TaskStarted {
        index: usize,
    },
    /// A task returned, failed or panicked
    TaskFinished {
        index: usize,
        success: bool,
        error: Option<String>,
    },
    /// A task was answered from the ledger
    TaskSkipped {
        index: usize,
        key: String,
        reason: String,
    },
    /// A ledger record was written
    LedgerUpdated {
        key: String,
        status: LedgerStatus,
    },
    /// A ledger record could not be written
    LedgerWriteFailed {
        path: String,
        error: String,
    },
    /// Every submitted task has a result
    RunFinished {
        total: usize,
        succeeded: usize,
        failed: usize,
    },
}

impl RunEvent {
    /// Serialize to JSON line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Sink for run events, injected into every runner
pub trait Observer: Send + Sync {
    fn observe(&self, event: &RunEvent);
}

/// Forwards events to the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn observe(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                total,
                parallel,
                mode,
                workers,
            } => {
                if *parallel {
                    log::info!(target: "batchctl", "Running {} tasks on {} {} workers", total, workers, mode);
                } else {
                    log::info!(target: "batchctl", "Running {} tasks serially", total);
                }
            }
            RunEvent::TaskStarted { index } => {
                log::debug!(target: "batchctl", "Task #{} started", index);
            }
            RunEvent::TaskFinished {
                index,
                success: true,
                ..
            } => {
                log::debug!(target: "batchctl", "Task #{} succeeded", index);
            }
            RunEvent::TaskFinished { index, error, .. } => {
                log::warn!(
                    target: "batchctl",
                    "Task #{} failed: {}",
                    index,
                    error.as_deref().unwrap_or("unknown error")
                );
            }
            RunEvent::TaskSkipped { index, key, reason } => {
                log::info!(target: "batchctl", "Skipping task #{} ({}): {}", index, key, reason);
            }
            RunEvent::LedgerUpdated { key, status } => {
                log::debug!(target: "batchctl", "Ledger {} -> {}", key, status);
            }
            RunEvent::LedgerWriteFailed { path, error } => {
                log::error!(target: "batchctl", "Failed to write ledger {}: {}", path, error);
            }
            RunEvent::RunFinished {
                total,
                succeeded,
                failed,
            } => {
                log::info!(
                    target: "batchctl",
                    "Finished {} tasks ({} succeeded, {} failed)",
                    total,
                    succeeded,
                    failed
                );
            }
        }
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn observe(&self, _event: &RunEvent) {}
}

/// Broadcast-based event stream for multiple consumers
pub struct EventStream {
    tx: broadcast::Sender<RunEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Observer for EventStream {
    fn observe(&self, event: &RunEvent) {
        self.emit(event.clone());
    }
}
