//! Core engine - task values, runner configuration and the batch runner

mod command;
mod config;
mod runner;
mod task;

pub use command::CommandSpec;
pub use config::{available_workers, ConfigError, ParallelMode, RunnerConfig, RunnerConfigBuilder};
pub(crate) use runner::{Planned, Progress};
pub use runner::CoreRunner;
pub use task::{Task, TaskFn, TaskFunction, TaskResult};
