//! File-backed runner settings
//!
//! ```yaml
//! parallel: true
//! max_workers: 4
//! parallel_mode: threads      # or processes
//! inter_task_delay_ms: 250
//! ledger_dir: /var/lib/batchctl
//! failure_policy: retry       # or skip
//! ```

use crate::core::{ConfigError, ParallelMode, RunnerConfig, TaskFunction};
use crate::session::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file looked up in the working directory
pub const SETTINGS_FILE: &str = "batchctl.yml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSettings {
    pub parallel: bool,
    /// Signed so that a negative count is reported as invalid, not unparseable
    pub max_workers: Option<i64>,
    pub parallel_mode: ParallelMode,
    pub inter_task_delay_ms: u64,
    pub ledger_dir: Option<PathBuf>,
    pub failure_policy: FailurePolicy,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            parallel: true,
            max_workers: None,
            parallel_mode: ParallelMode::Threads,
            inter_task_delay_ms: 0,
            ledger_dir: None,
            failure_policy: FailurePolicy::Retry,
        }
    }
}

impl RunnerSettings {
    /// Load settings from a YAML (or JSON) file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Settings {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Settings { reason, .. } => ConfigError::Settings {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| ConfigError::Settings {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Per-user settings file
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("batchctl").join("config.yml"))
    }

    /// Auto-detect and load settings
    /// Priority:
    /// 1. ./batchctl.yml
    /// 2. <user config dir>/batchctl/config.yml
    /// 3. Defaults
    pub fn auto_load() -> Result<Self, ConfigError> {
        let local = Path::new(SETTINGS_FILE);
        if local.exists() {
            return Self::from_file(local);
        }

        if let Some(user) = Self::user_config_path() {
            if user.exists() {
                return Self::from_file(&user);
            }
        }

        Ok(Self::default())
    }

    /// Where ledgers live; the working directory unless configured
    pub fn ledger_dir(&self) -> PathBuf {
        self.ledger_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn inter_task_delay(&self) -> Duration {
        Duration::from_millis(self.inter_task_delay_ms)
    }

    /// Validate the settings into a runner configuration for `function`
    pub fn runner_config(&self, function: TaskFunction) -> Result<RunnerConfig, ConfigError> {
        let mut builder = RunnerConfig::builder()
            .function(function)
            .parallel(self.parallel)
            .parallel_mode(self.parallel_mode)
            .inter_task_delay(self.inter_task_delay());
        if let Some(workers) = self.max_workers {
            builder = builder.max_workers_signed(workers);
        }
        builder.build()
    }
}
