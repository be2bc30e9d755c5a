use batchctl::{
    CoreRunner, EventStream, FileGate, NullObserver, RunEvent, RunnerConfig, SessionRunner, Task,
    TaskFunction,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn delayed_echo() -> TaskFunction {
    TaskFunction::inline(|args: &[Value]| {
        let ms = args[1].as_u64().unwrap_or(0);
        std::thread::sleep(Duration::from_millis(ms));
        Ok(args[0].clone())
    })
}

#[tokio::test]
async fn test_results_follow_input_order() {
    let config = RunnerConfig::builder()
        .function(delayed_echo())
        .max_workers(3)
        .build()
        .unwrap();
    let runner = CoreRunner::new(config, Arc::new(NullObserver));

    let tasks = vec![
        Task::new(vec![json!("first"), json!(300)]),
        Task::new(vec![json!("second"), json!(100)]),
        Task::new(vec![json!("third"), json!(200)]),
    ];
    let results = runner.run(tasks).await;

    let values: Vec<Value> = results.into_iter().map(|r| r.value.unwrap()).collect();
    assert_eq!(values, vec![json!("first"), json!("second"), json!("third")]);
}

#[tokio::test]
async fn test_length_preserved_in_both_modes() {
    for parallel in [false, true] {
        let config = RunnerConfig::builder()
            .function(delayed_echo())
            .parallel(parallel)
            .build()
            .unwrap();
        let runner = CoreRunner::new(config, Arc::new(NullObserver));
        let tasks: Vec<Task> = (0..25).map(|i| Task::new(vec![json!(i), json!(0)])).collect();

        assert_eq!(runner.run(tasks).await.len(), 25);
    }
}

#[test]
fn test_one_bad_task_does_not_sink_the_batch() {
    let function = TaskFunction::inline(|args: &[Value]| {
        if args[0] == json!("raise") {
            anyhow::bail!("boom");
        }
        Ok(args[0].clone())
    });
    let config = RunnerConfig::builder().function(function).build().unwrap();
    let runner = CoreRunner::new(config, Arc::new(NullObserver));

    let results = tokio_test::block_on(runner.run(vec![
        Task::new(["ok"]),
        Task::new(["raise"]),
        Task::new(["ok"]),
    ]));

    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[1].error.as_ref().unwrap().contains("boom"));
    assert!(results[2].success);
}

#[tokio::test]
async fn test_session_resumes_across_runner_instances() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let make_runner = |calls: Arc<AtomicUsize>| {
        let function = TaskFunction::inline(move |args: &[Value]| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(args.len()))
        });
        let config = RunnerConfig::builder().function(function).build().unwrap();
        SessionRunner::new(CoreRunner::new(config, Arc::new(NullObserver)), dir.path())
    };
    let tasks = || vec![Task::new(["a.xlsx"]), Task::new(["b.xlsx"]), Task::new(["c.ofx"])];

    let first = make_runner(calls.clone())
        .run(tasks(), None, true)
        .await
        .unwrap();
    // A fresh runner, as after a process restart
    let second = make_runner(calls.clone())
        .run(tasks(), Some(&first.session_id), true)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(second.skipped(), 3);
    assert_eq!(second.session_id, first.session_id);
}

#[tokio::test]
async fn test_file_gate_follows_modification_time() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("statement.ofx");
    std::fs::write(&input, "<OFX></OFX>").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let function = TaskFunction::inline(move |_args: &[Value]| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    });
    let stream = Arc::new(EventStream::default());
    let mut events = stream.subscribe();
    let config = RunnerConfig::builder().function(function).build().unwrap();
    let gate = FileGate::new(CoreRunner::new(config, stream.clone()), "ofx", dir.path());
    let task = || vec![(Task::new([input.display().to_string()]), input.clone())];

    gate.run(task(), true).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let file = std::fs::File::options().write(true).open(&input).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(120))
        .unwrap();
    gate.run(task(), true).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    gate.run(task(), true).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let mut skipped = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RunEvent::TaskSkipped { .. }) {
            skipped += 1;
        }
    }
    assert_eq!(skipped, 1);
}

#[test]
fn test_worker_count_boundaries() {
    let noop = || TaskFunction::inline(|_| Ok(Value::Null));

    assert!(RunnerConfig::builder()
        .function(noop())
        .max_workers(0)
        .build()
        .is_err());
    assert!(RunnerConfig::builder()
        .function(noop())
        .max_workers_signed(-1)
        .build()
        .is_err());
    assert!(RunnerConfig::builder()
        .function(noop())
        .max_workers(1)
        .build()
        .is_ok());
}
