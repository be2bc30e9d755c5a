//! batchctl CLI entry point

use anyhow::{Context, Result};
use batchctl::{
    CommandSpec, CoreRunner, Error, FailurePolicy, FileGate, Ledger, ParallelMode,
    RunnerSettings, SessionRunner, Task, TaskFunction, TaskResult,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "batchctl", version, about = "Run a command over a batch of inputs, resumably")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run PROGRAM once per line of a JSON-lines task file, under a session
    Run {
        /// File with one JSON array of arguments per line
        #[arg(short, long)]
        tasks: PathBuf,

        /// Session to resume (a new one is created if omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Skip tasks the session already completed
        #[arg(long)]
        controlled: bool,

        #[command(flatten)]
        runner: RunnerArgs,

        /// Program and arguments; task arguments arrive on stdin as JSON
        #[arg(last = true, required = true)]
        program: Vec<String>,
    },
    /// Run PROGRAM once per file, skipping files unchanged since their last success
    Files {
        /// Name of the file control ledger
        #[arg(long, default_value = "files")]
        context: String,

        /// Skip files that have not changed since they last succeeded
        #[arg(long)]
        controlled: bool,

        /// Input file (repeatable)
        #[arg(short, long = "file", required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        runner: RunnerArgs,

        /// Program and arguments; the file path arrives on stdin as JSON
        #[arg(last = true, required = true)]
        program: Vec<String>,
    },
    /// Print the records of a ledger file
    Ledger {
        path: PathBuf,
    },
}

#[derive(Args, Clone)]
struct RunnerArgs {
    /// Settings file (default: ./batchctl.yml, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run tasks one at a time
    #[arg(long)]
    serial: bool,

    /// Size of the worker pool
    #[arg(short, long, allow_negative_numbers = true)]
    workers: Option<i64>,

    /// threads or processes
    #[arg(long)]
    mode: Option<String>,

    /// Pause between tasks in serial mode
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Directory holding ledgers (default: working directory)
    #[arg(long)]
    ledger_dir: Option<PathBuf>,

    /// Do not retry tasks a session recorded as failed
    #[arg(long)]
    skip_failed: bool,
}

impl RunnerArgs {
    fn settings(&self) -> Result<RunnerSettings> {
        let mut settings = match &self.config {
            Some(path) => RunnerSettings::from_file(path)?,
            None => RunnerSettings::auto_load()?,
        };

        if self.serial {
            settings.parallel = false;
        }
        if let Some(workers) = self.workers {
            settings.max_workers = Some(workers);
        }
        if let Some(mode) = &self.mode {
            settings.parallel_mode = mode.parse::<ParallelMode>()?;
        }
        if let Some(delay) = self.delay_ms {
            settings.inter_task_delay_ms = delay;
        }
        if let Some(dir) = &self.ledger_dir {
            settings.ledger_dir = Some(dir.clone());
        }
        if self.skip_failed {
            settings.failure_policy = FailurePolicy::Skip;
        }

        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match execute(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns whether every task succeeded
async fn execute(command: Command) -> Result<bool> {
    match command {
        Command::Run {
            tasks,
            session,
            controlled,
            runner,
            program,
        } => run_session(&tasks, session.as_deref(), controlled, &runner, &program).await,
        Command::Files {
            context,
            controlled,
            files,
            runner,
            program,
        } => run_files(&context, controlled, files, &runner, &program).await,
        Command::Ledger { path } => {
            let ledger = Ledger::open(&path)?;
            println!("{}", serde_json::to_string_pretty(ledger.records())?);
            Ok(true)
        }
    }
}

async fn run_session(
    tasks_path: &Path,
    session: Option<&str>,
    controlled: bool,
    args: &RunnerArgs,
    program: &[String],
) -> Result<bool> {
    let settings = args.settings()?;
    let tasks = read_tasks(tasks_path)?;
    log::info!("Loaded {} tasks from {}", tasks.len(), tasks_path.display());

    let config = settings.runner_config(command_function(program)?)?;
    let runner = SessionRunner::new(CoreRunner::with_logging(config), settings.ledger_dir())
        .with_failure_policy(settings.failure_policy);

    let (report, persist_error) = match runner.run(tasks, session, controlled).await {
        Ok(report) => (report, None),
        Err(Error::SessionNotPersisted { source, report }) => (*report, Some(source)),
        Err(e) => return Err(e.into()),
    };

    eprintln!("session: {}", report.session_id);
    for (task_id, result) in &report.results {
        println!("{}", result_line("task_id", json!(task_id), result));
    }

    if let Some(e) = persist_error {
        return Err(e).context(format!("session {} is not fully recorded", report.session_id));
    }
    Ok(report.failed() == 0)
}

async fn run_files(
    context: &str,
    controlled: bool,
    files: Vec<PathBuf>,
    args: &RunnerArgs,
    program: &[String],
) -> Result<bool> {
    let settings = args.settings()?;
    let config = settings.runner_config(command_function(program)?)?;
    let gate = FileGate::new(CoreRunner::with_logging(config), context, settings.ledger_dir());

    let tasks = files
        .into_iter()
        .map(|path| (Task::new([path.display().to_string()]), path))
        .collect();

    let (results, persist_error) = match gate.run(tasks, controlled).await {
        Ok(results) => (results, None),
        Err(Error::FilesNotPersisted { source, results }) => (results, Some(source)),
        Err(e) => return Err(e.into()),
    };

    for (path, result) in &results {
        println!("{}", result_line("file", json!(path.display().to_string()), result));
    }

    if let Some(e) = persist_error {
        return Err(e).context(format!("context {} is not fully recorded", context));
    }
    Ok(results.iter().all(|(_, r)| r.success))
}

fn command_function(program: &[String]) -> Result<TaskFunction> {
    let (name, rest) = program
        .split_first()
        .context("no program given after --")?;
    Ok(TaskFunction::command(CommandSpec::new(name).args(rest)))
}

/// One task per non-empty line; scalars become single-argument tasks
fn read_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file {}", path.display()))?;

    let mut tasks = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), number + 1))?;
        tasks.push(match value {
            Value::Array(args) => Task::from(args),
            scalar => Task::new([scalar]),
        });
    }
    Ok(tasks)
}

fn result_line(id_field: &str, id: Value, result: &TaskResult) -> String {
    let mut line = json!({
        "success": result.success,
        "error": result.error,
        "value": result.value,
        "skipped": result.skipped,
    });
    line[id_field] = id;
    line.to_string()
}
