//! File gate - skip files that have not changed since their last success

use crate::core::{CoreRunner, Planned, Progress, Task, TaskResult};
use crate::error::{Error, Result};
use crate::events::RunEvent;
use crate::ledger::{self, Ledger, LedgerError, LedgerRecord, LedgerStatus};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// Runs file-oriented batches, remembering each file's modification time
pub struct FileGate {
    runner: CoreRunner,
    context: String,
    ledger_dir: PathBuf,
}

impl FileGate {
    /// `context` names the ledger, `<ledger_dir>/<context>.filecontrol`
    pub fn new(runner: CoreRunner, context: impl Into<String>, ledger_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            context: context.into(),
            ledger_dir: ledger_dir.into(),
        }
    }

    pub fn runner(&self) -> &CoreRunner {
        &self.runner
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn ledger_path(&self) -> PathBuf {
        Ledger::filecontrol_path(&self.ledger_dir, &self.context)
    }

    /// Run each task against its file.
    ///
    /// Uncontrolled runs neither read nor write the ledger. Controlled runs
    /// skip files whose recorded timestamp is at least their current
    /// modification time, and record successes as they finish. Failures are
    /// never recorded, so failed files run again next time.
    pub async fn run(
        &self,
        tasks: Vec<(Task, PathBuf)>,
        controlled: bool,
    ) -> Result<Vec<(PathBuf, TaskResult)>> {
        if !ledger::is_valid_name(&self.context) {
            return Err(Error::InvalidContext(self.context.clone()));
        }

        let (tasks, paths): (Vec<Task>, Vec<PathBuf>) = tasks.into_iter().unzip();

        if !controlled {
            let results = self.runner.run(tasks).await;
            return Ok(paths.into_iter().zip(results).collect());
        }

        let mut ledger = Ledger::open(self.ledger_path()).map_err(Error::LedgerRead)?;
        let observer = self.runner.observer().clone();

        // Ledger key and modification time per input position
        let mut probes: Vec<Option<(String, DateTime<Utc>)>> = Vec::with_capacity(tasks.len());
        let mut plan = Vec::with_capacity(tasks.len());

        for (task, path) in tasks.into_iter().zip(&paths) {
            let (key, modified) = match probe(path) {
                Ok(probed) => probed,
                Err(e) => {
                    probes.push(None);
                    plan.push(Planned::Settled(TaskResult::failure(format!(
                        "cannot read modification time of {}: {}",
                        path.display(),
                        e
                    ))));
                    continue;
                }
            };

            let unchanged = ledger.get(&key).filter(|record| {
                record.status == LedgerStatus::CompletedSuccess && record.timestamp >= modified
            });
            plan.push(match unchanged {
                Some(record) => Planned::Skip {
                    key: key.clone(),
                    reason: "unchanged since last success".to_string(),
                    result: record.to_result(),
                },
                None => Planned::Run(task),
            });
            probes.push(Some((key, modified)));
        }

        let mut persist_error: Option<LedgerError> = None;
        let results = self
            .runner
            .run_with(plan, |progress| {
                let Progress::Finished(index, result) = progress else {
                    return;
                };
                if !result.success || persist_error.is_some() {
                    return;
                }
                let Some((key, modified)) = &probes[index] else {
                    return;
                };
                let attempts = ledger.get(key).map(|r| r.attempts).unwrap_or(0) + 1;
                let record = LedgerRecord {
                    status: LedgerStatus::CompletedSuccess,
                    timestamp: *modified,
                    summary: result.value.clone(),
                    error: None,
                    attempts,
                };
                match ledger.put(key, record) {
                    Ok(()) => observer.observe(&RunEvent::LedgerUpdated {
                        key: key.clone(),
                        status: LedgerStatus::CompletedSuccess,
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

        let results: Vec<(PathBuf, TaskResult)> = paths.into_iter().zip(results).collect();

        match persist_error {
            Some(source) => Err(Error::FilesNotPersisted { source, results }),
            None => Ok(results),
        }
    }
}

/// Ledger key and current modification time of a file
fn probe(path: &Path) -> std::io::Result<(String, DateTime<Utc>)> {
    let modified = fs::metadata(path)?.modified()?;
    let key = fs::canonicalize(path)?.to_string_lossy().into_owned();
    Ok((key, DateTime::<Utc>::from(modified)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunnerConfig, TaskFunction};
    use crate::events::{EventStream, NullObserver};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn counting_gate(dir: &Path, calls: Arc<AtomicUsize>) -> FileGate {
        let function = TaskFunction::inline(move |args: &[Value]| {
            calls.fetch_add(1, Ordering::SeqCst);
            match args[0].as_str() {
                Some(name) if name.ends_with("bad.txt") => anyhow::bail!("cannot parse {}", name),
                Some(name) => Ok(json!(name.len())),
                None => anyhow::bail!("expected a path"),
            }
        });
        let config = RunnerConfig::builder().function(function).build().unwrap();
        FileGate::new(CoreRunner::new(config, Arc::new(NullObserver)), "parse", dir)
    }

    fn file_task(path: &Path) -> (Task, PathBuf) {
        (
            Task::new([path.to_string_lossy().into_owned()]),
            path.to_path_buf(),
        )
    }

    fn touch(path: &Path, offset: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + offset).unwrap();
    }

    #[tokio::test]
    async fn test_runs_again_only_after_modification() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "data").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = counting_gate(dir.path(), calls.clone());

        let first = gate.run(vec![file_task(&input)], true).await.unwrap();
        assert!(first[0].1.success && !first[0].1.skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second = gate.run(vec![file_task(&input)], true).await.unwrap();
        assert!(second[0].1.success && second[0].1.skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        touch(&input, Duration::from_secs(60));
        gate.run(vec![file_task(&input)], true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        gate.run(vec![file_task(&input)], true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.txt");
        fs::write(&bad, "???").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = counting_gate(dir.path(), calls.clone());

        for _ in 0..2 {
            let results = gate.run(vec![file_task(&bad)], true).await.unwrap();
            assert!(!results[0].1.success);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let ledger = Ledger::open(gate.ledger_path()).unwrap();
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_uncontrolled_ignores_ledger() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "data").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = counting_gate(dir.path(), calls.clone());

        gate.run(vec![file_task(&input)], false).await.unwrap();
        gate.run(vec![file_task(&input)], false).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!gate.ledger_path().exists());
    }

    #[tokio::test]
    async fn test_missing_file_fails_alone() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present.txt");
        fs::write(&present, "x").unwrap();
        let missing = dir.path().join("missing.txt");
        let gate = counting_gate(dir.path(), Arc::new(AtomicUsize::new(0)));

        let results = gate
            .run(vec![file_task(&missing), file_task(&present)], true)
            .await
            .unwrap();

        assert_eq!(results[0].0, missing);
        assert!(!results[0].1.success);
        assert_eq!(results[1].0, present);
        assert!(results[1].1.success);
    }

    #[tokio::test]
    async fn test_order_follows_input_with_skips() {
        let dir = TempDir::new().unwrap();
        let names = ["one.txt", "two.txt", "three.txt"];
        let paths: Vec<PathBuf> = names.iter().map(|n| dir.path().join(n)).collect();
        for p in &paths {
            fs::write(p, "x").unwrap();
        }
        let gate = counting_gate(dir.path(), Arc::new(AtomicUsize::new(0)));

        gate.run(vec![file_task(&paths[1])], true).await.unwrap();
        let results = gate
            .run(paths.iter().map(|p| file_task(p)).collect(), true)
            .await
            .unwrap();

        let returned: Vec<&PathBuf> = results.iter().map(|(p, _)| p).collect();
        assert_eq!(returned, paths.iter().collect::<Vec<_>>());
        assert!(!results[0].1.skipped);
        assert!(results[1].1.skipped);
        assert!(!results[2].1.skipped);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_is_fatal() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "data").unwrap();
        let gate = counting_gate(dir.path(), Arc::new(AtomicUsize::new(0)));
        fs::write(gate.ledger_path(), "[1, 2").unwrap();

        let err = gate.run(vec![file_task(&input)], true).await.unwrap_err();
        assert!(matches!(err, Error::LedgerRead(LedgerError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_unwritable_ledger_still_returns_results() {
        let dir = TempDir::new().unwrap();
        let not_a_dir = dir.path().join("ledgers");
        fs::write(&not_a_dir, "").unwrap();
        let paths: Vec<PathBuf> = ["a.txt", "b.txt", "bad.txt"]
            .iter()
            .map(|n| dir.path().join(n))
            .collect();
        for p in &paths {
            fs::write(p, "x").unwrap();
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = counting_gate(&not_a_dir, calls.clone());

        let err = gate
            .run(paths.iter().map(|p| file_task(p)).collect(), true)
            .await
            .unwrap_err();

        match err {
            Error::FilesNotPersisted { results, .. } => {
                let returned: Vec<&PathBuf> = results.iter().map(|(p, _)| p).collect();
                assert_eq!(returned, paths.iter().collect::<Vec<_>>());
                assert!(results[0].1.success);
                assert!(results[1].1.success);
                assert!(!results[2].1.success);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_context_must_be_a_file_name() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "data").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        for context in ["../outside", "a/b", ""] {
            let counter = calls.clone();
            let function = TaskFunction::inline(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            });
            let config = RunnerConfig::builder().function(function).build().unwrap();
            let gate = FileGate::new(
                CoreRunner::new(config, Arc::new(NullObserver)),
                context,
                dir.path(),
            );

            let err = gate.run(vec![file_task(&input)], true).await.unwrap_err();
            assert!(matches!(err, Error::InvalidContext(_)), "{:?}", context);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().parent().unwrap().join("outside.filecontrol").exists());
    }

    #[tokio::test]
    async fn test_events_use_input_positions() {
        let dir = TempDir::new().unwrap();
        let done = dir.path().join("done.txt");
        let missing = dir.path().join("missing.txt");
        let fresh = dir.path().join("fresh.txt");
        fs::write(&done, "x").unwrap();
        fs::write(&fresh, "x").unwrap();
        counting_gate(dir.path(), Arc::new(AtomicUsize::new(0)))
            .run(vec![file_task(&done)], true)
            .await
            .unwrap();

        let stream = Arc::new(EventStream::default());
        let mut rx = stream.subscribe();
        let function = TaskFunction::inline(|_| Ok(Value::Null));
        let config = RunnerConfig::builder().function(function).build().unwrap();
        let gate = FileGate::new(CoreRunner::new(config, stream.clone()), "parse", dir.path());

        gate.run(
            vec![file_task(&done), file_task(&missing), file_task(&fresh)],
            true,
        )
        .await
        .unwrap();

        let events: Vec<RunEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(events[0], RunEvent::RunStarted { total: 3, .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::TaskSkipped { index: 0, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::TaskFinished { index: 1, success: false, .. })));
        assert!(events.contains(&RunEvent::TaskStarted { index: 2 }));
        assert_eq!(
            events.last(),
            Some(&RunEvent::RunFinished {
                total: 3,
                succeeded: 2,
                failed: 1
            })
        );
    }
}
