//! Runner configuration and validation

use super::task::TaskFunction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How parallel tasks are isolated from each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelMode {
    /// Worker threads sharing this process
    #[default]
    Threads,
    /// One child process per task
    Processes,
}

impl fmt::Display for ParallelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threads => write!(f, "threads"),
            Self::Processes => write!(f, "processes"),
        }
    }
}

impl FromStr for ParallelMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threads" => Ok(Self::Threads),
            "processes" => Ok(Self::Processes),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Rejected runner configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_workers must be at least 1, got {0}")]
    InvalidWorkers(i64),
    #[error("unknown parallel mode '{0}', expected 'threads' or 'processes'")]
    UnknownMode(String),
    #[error("no task function given")]
    MissingFunction,
    #[error("parallel mode 'processes' requires an isolated command function")]
    NotIsolated,
    #[error("failed to load settings from {path}: {reason}")]
    Settings { path: String, reason: String },
}

/// Logical CPUs available to this process, at least 1
pub fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Validated runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub(crate) function: TaskFunction,
    pub(crate) parallel: bool,
    pub(crate) max_workers: usize,
    pub(crate) parallel_mode: ParallelMode,
    pub(crate) inter_task_delay: Duration,
}

impl RunnerConfig {
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }

    /// Defaults around a function: parallel threads, one worker per CPU
    pub fn new(function: TaskFunction) -> Result<Self, ConfigError> {
        Self::builder().function(function).build()
    }

    pub fn function(&self) -> &TaskFunction {
        &self.function
    }

    pub fn parallel(&self) -> bool {
        self.parallel
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn parallel_mode(&self) -> ParallelMode {
        self.parallel_mode
    }

    pub fn inter_task_delay(&self) -> Duration {
        self.inter_task_delay
    }
}

/// Builder for [`RunnerConfig`]
#[derive(Debug, Clone)]
pub struct RunnerConfigBuilder {
    function: Option<TaskFunction>,
    parallel: bool,
    max_workers: Option<i64>,
    parallel_mode: ParallelMode,
    inter_task_delay: Duration,
}

impl Default for RunnerConfigBuilder {
    fn default() -> Self {
        Self {
            function: None,
            parallel: true,
            max_workers: None,
            parallel_mode: ParallelMode::Threads,
            inter_task_delay: Duration::ZERO,
        }
    }
}

impl RunnerConfigBuilder {
    pub fn function(mut self, function: TaskFunction) -> Self {
        self.function = Some(function);
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(i64::try_from(workers).unwrap_or(i64::MAX));
        self
    }

    /// Signed variant for values coming from configuration files
    pub fn max_workers_signed(mut self, workers: i64) -> Self {
        self.max_workers = Some(workers);
        self
    }

    pub fn parallel_mode(mut self, mode: ParallelMode) -> Self {
        self.parallel_mode = mode;
        self
    }

    /// Pause between invocations in serial mode
    pub fn inter_task_delay(mut self, delay: Duration) -> Self {
        self.inter_task_delay = delay;
        self
    }

    pub fn build(self) -> Result<RunnerConfig, ConfigError> {
        let function = self.function.ok_or(ConfigError::MissingFunction)?;

        let max_workers = match self.max_workers {
            None => available_workers(),
            Some(n) if n < 1 => return Err(ConfigError::InvalidWorkers(n)),
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
        };

        if self.parallel_mode == ParallelMode::Processes && !function.is_isolated() {
            return Err(ConfigError::NotIsolated);
        }

        Ok(RunnerConfig {
            function,
            parallel: self.parallel,
            max_workers,
            parallel_mode: self.parallel_mode,
            inter_task_delay: self.inter_task_delay,
        })
    }
}
