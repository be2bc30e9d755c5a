//! Isolated task execution - one child process per task
//!
//! The task's arguments are written to the child's stdin as a JSON array.
//! Whatever the child prints on stdout becomes the task value.

use super::task::{Task, TaskResult};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Program invoked for every task
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Run the program for one task and wait for it to exit
    pub async fn execute(&self, task: &Task) -> TaskResult {
        match self.spawn_and_wait(task).await {
            Ok(result) => result,
            Err(e) => TaskResult::failure(format!("{}: {:#}", self.program, e)),
        }
    }

    async fn spawn_and_wait(&self, task: &Task) -> anyhow::Result<TaskResult> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;

        let payload = serde_json::to_vec(task.args())?;
        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading closes the pipe early; its
            // exit status decides the outcome.
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("process exited with {}", output.status)
            } else {
                stderr
            };
            return Ok(TaskResult::failure(message));
        }

        Ok(TaskResult::success(parse_stdout(&output.stdout)))
    }
}

/// Empty output is null, JSON is kept as-is, anything else becomes a string
fn parse_stdout(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
