//! Task and result value types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use super::command::CommandSpec;

/// One unit of work: the positional arguments for a single invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Task {
    args: Vec<Value>,
}

impl Task {
    /// Create a task from anything convertible into JSON values
    pub fn new<I, V>(args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Positional arguments
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Stable identity of the argument tuple.
    ///
    /// Object keys are sorted at every depth before hashing, so key order
    /// never changes the result.
    pub fn fingerprint(&self) -> String {
        let canonical: Vec<Value> = self.args.iter().map(canonicalize).collect();
        let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }
}

/// Copy of `value` with every object's keys in sorted order
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl From<Vec<Value>> for Task {
    fn from(args: Vec<Value>) -> Self {
        Self { args }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.args) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "<{} args>", self.args.len()),
        }
    }
}

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub error: Option<String>,
    pub value: Option<Value>,
    /// Synthesized from a ledger record instead of an invocation
    #[serde(default)]
    pub skipped: bool,
}

impl TaskResult {
    pub fn success(value: Value) -> Self {
        Self {
            success: true,
            error: None,
            value: Some(value),
            skipped: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            value: None,
            skipped: false,
        }
    }

    /// Mark the result as not produced by this run
    pub fn into_skipped(mut self) -> Self {
        self.skipped = true;
        self
    }

    pub fn is_failure(&self) -> bool {
        !self.success
    }
}

/// In-process task callable
pub type TaskFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// The function a runner applies to every task
#[derive(Clone)]
pub enum TaskFunction {
    /// Closure called on the blocking thread pool
    Inline(TaskFn),
    /// Child process fed the arguments as JSON
    Command(CommandSpec),
}

impl TaskFunction {
    pub fn inline<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Inline(Arc::new(f))
    }

    pub fn command(spec: CommandSpec) -> Self {
        Self::Command(spec)
    }

    /// Whether tasks can run in a separate address space.
    ///
    /// Only command functions qualify: their arguments and results cross the
    /// process boundary as JSON.
    pub fn is_isolated(&self) -> bool {
        matches!(self, Self::Command(_))
    }
}

impl fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(_) => write!(f, "TaskFunction::Inline(..)"),
            Self::Command(spec) => write!(f, "TaskFunction::Command({:?})", spec.program),
        }
    }
}
