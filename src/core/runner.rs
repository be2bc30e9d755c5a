//! Core runner - applies one function to a batch of tasks
//!
//! Parallel workers report over an mpsc channel; the collector files each
//! result under its input index, so the output order never depends on
//! completion order.

use super::config::RunnerConfig;
use super::task::{Task, TaskFunction, TaskResult};
use crate::events::{LogObserver, Observer, RunEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinError;

/// Worker report, tagged with the task's input index
#[derive(Debug)]
enum TaskEvent {
    Started { index: usize },
    Finished { index: usize, result: TaskResult },
}

/// Completion seen by a run hook, in the order tasks actually finish.
/// Indices are positions in the submitted batch.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Progress<'a> {
    Started(usize),
    Finished(usize, &'a TaskResult),
}

/// One entry of a batch whose outcome may already be known
#[derive(Debug)]
pub(crate) enum Planned {
    /// Hand the task to the function
    Run(Task),
    /// Answered from a ledger record
    Skip {
        key: String,
        reason: String,
        result: TaskResult,
    },
    /// Failed before it could be handed to the function
    Settled(TaskResult),
}

/// Executes a function over ordered task lists
pub struct CoreRunner {
    config: RunnerConfig,
    observer: Arc<dyn Observer>,
}

impl CoreRunner {
    pub fn new(config: RunnerConfig, observer: Arc<dyn Observer>) -> Self {
        Self { config, observer }
    }

    /// Runner reporting through the `log` facade
    pub fn with_logging(config: RunnerConfig) -> Self {
        Self::new(config, Arc::new(LogObserver))
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    /// Run every task and return one result per task, in input order
    pub async fn run(&self, tasks: Vec<Task>) -> Vec<TaskResult> {
        let plan = tasks.into_iter().map(Planned::Run).collect();
        self.run_with(plan, |_| {}).await
    }

    /// Run the `Run` entries of a batch and return one result per entry, in
    /// input order. `hook` is called on the collecting task for every start
    /// and finish before the next report is handled. Events and totals
    /// describe the whole batch, skipped and settled entries included.
    pub(crate) async fn run_with<H>(&self, plan: Vec<Planned>, mut hook: H) -> Vec<TaskResult>
    where
        H: FnMut(Progress<'_>),
    {
        let total = plan.len();
        self.observer.observe(&RunEvent::RunStarted {
            total,
            parallel: self.config.parallel,
            mode: self.config.parallel_mode,
            workers: self.config.max_workers,
        });

        let mut slots: Vec<Option<TaskResult>> = vec![None; total];
        let mut to_run = Vec::new();
        for (index, entry) in plan.into_iter().enumerate() {
            match entry {
                Planned::Run(task) => to_run.push((index, task)),
                Planned::Skip { key, reason, result } => {
                    self.observer
                        .observe(&RunEvent::TaskSkipped { index, key, reason });
                    slots[index] = Some(result);
                }
                Planned::Settled(result) => {
                    self.observer.observe(&RunEvent::TaskFinished {
                        index,
                        success: result.success,
                        error: result.error.clone(),
                    });
                    slots[index] = Some(result);
                }
            }
        }

        if self.config.parallel {
            self.run_parallel(to_run, &mut slots, &mut hook).await;
        } else {
            self.run_serial(to_run, &mut slots, &mut hook).await;
        }

        let results: Vec<TaskResult> = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| TaskResult::failure("worker exited without a result")))
            .collect();

        let succeeded = results.iter().filter(|r| r.success).count();
        self.observer.observe(&RunEvent::RunFinished {
            total,
            succeeded,
            failed: total - succeeded,
        });

        results
    }

    async fn run_serial<H>(
        &self,
        tasks: Vec<(usize, Task)>,
        slots: &mut [Option<TaskResult>],
        hook: &mut H,
    ) where
        H: FnMut(Progress<'_>),
    {
        let delay = self.config.inter_task_delay;
        let count = tasks.len();

        for (position, (index, task)) in tasks.into_iter().enumerate() {
            self.handle(TaskEvent::Started { index }, hook);

            let result = invoke(&self.config.function, task).await;
            if let Some((index, result)) = self.handle(TaskEvent::Finished { index, result }, hook) {
                slots[index] = Some(result);
            }

            if !delay.is_zero() && position + 1 < count {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn run_parallel<H>(
        &self,
        tasks: Vec<(usize, Task)>,
        slots: &mut [Option<TaskResult>],
        hook: &mut H,
    ) where
        H: FnMut(Progress<'_>),
    {
        let workers = self.config.max_workers.clamp(1, Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(workers));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        for (index, task) in tasks {
            let event_tx = event_tx.clone();
            let semaphore = semaphore.clone();
            let function = self.config.function.clone();

            tokio::spawn(async move {
                // Held until the task finishes
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = event_tx.send(TaskEvent::Finished {
                            index,
                            result: TaskResult::failure("worker pool closed"),
                        });
                        return;
                    }
                };

                let _ = event_tx.send(TaskEvent::Started { index });
                let result = invoke(&function, task).await;
                let _ = event_tx.send(TaskEvent::Finished { index, result });
            });
        }
        drop(event_tx);

        while let Some(event) = event_rx.recv().await {
            if let Some((index, result)) = self.handle(event, hook) {
                slots[index] = Some(result);
            }
        }
    }

    /// Report an event to the observer and the hook, handing back finished results
    fn handle<H>(&self, event: TaskEvent, hook: &mut H) -> Option<(usize, TaskResult)>
    where
        H: FnMut(Progress<'_>),
    {
        match event {
            TaskEvent::Started { index } => {
                self.observer.observe(&RunEvent::TaskStarted { index });
                hook(Progress::Started(index));
                None
            }
            TaskEvent::Finished { index, result } => {
                self.observer.observe(&RunEvent::TaskFinished {
                    index,
                    success: result.success,
                    error: result.error.clone(),
                });
                hook(Progress::Finished(index, &result));
                Some((index, result))
            }
        }
    }
}

/// Call the task function once, turning every error and panic into a result
async fn invoke(function: &TaskFunction, task: Task) -> TaskResult {
    match function {
        TaskFunction::Inline(f) => {
            let f = f.clone();
            match tokio::task::spawn_blocking(move || f(task.args())).await {
                Ok(Ok(value)) => TaskResult::success(value),
                Ok(Err(e)) => TaskResult::failure(format!("{:#}", e)),
                Err(e) => TaskResult::failure(join_failure(e)),
            }
        }
        TaskFunction::Command(spec) => spec.execute(&task).await,
    }
}

fn join_failure(e: JoinError) -> String {
    if !e.is_panic() {
        return format!("task was cancelled: {}", e);
    }
    let payload = e.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", msg)
    } else {
        "task panicked".to_string()
    }
}
