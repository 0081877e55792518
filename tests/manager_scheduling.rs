use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskcore::manager::QueueEventFn;
use taskcore::task::{ChannelListener, TaskEventKind, TaskEventRecord};
use taskcore::{Priority, QueueEvent, RuntimeConfig, TaskError, TaskKey, TaskRef, TaskRuntime};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn runtime(max_jobs: Option<usize>, max_watched: usize) -> TaskRuntime {
    let mut config = RuntimeConfig::default();
    config.dispatcher_name = "manager-it".to_string();
    config.manager.max_jobs = max_jobs;
    config.manager.max_watched = max_watched;
    TaskRuntime::new(config).expect("runtime")
}

fn sleeper(runtime: &TaskRuntime, name: &str, priority: u8, millis: u64) -> TaskRef {
    runtime
        .task(name)
        .priority(Priority::new(priority).unwrap())
        .work(move |ctx| {
            ctx.sleep(Duration::from_millis(millis))?;
            Ok::<_, TaskError>(millis)
        })
        .build()
        .unwrap()
}

async fn wait_terminal(rx: &mut UnboundedReceiver<TaskEventRecord>, expected: usize) -> Vec<TaskRef> {
    let mut finished = Vec::new();
    while finished.len() < expected {
        let record = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for tasks")
            .expect("channel closed");
        if matches!(
            record.event.kind(),
            TaskEventKind::PostRun | TaskEventKind::Cancelled
        ) {
            finished.push(record.task);
        }
    }
    finished
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_run_queue_never_exceeds_max_jobs() {
    let runtime = runtime(Some(2), 0);
    let manager = runtime.manager().build().unwrap();

    let peak = Arc::new(Mutex::new(0usize));
    let seen = peak.clone();
    manager.add_queue_listener_default(QueueEventFn::new(move |_, _, _, run, _| {
        let mut peak = seen.lock().unwrap();
        *peak = (*peak).max(run);
    }));

    let (listener, mut rx) = ChannelListener::new();
    for i in 0..8 {
        let task = sleeper(&runtime, &format!("job-{i}"), 5, 20);
        task.add_listener_default(listener.clone());
        assert!(manager.add_task(&task));
    }

    let finished = wait_terminal(&mut rx, 8).await;
    assert!(finished.iter().all(|t| t.result_as::<u64>().as_deref() == Some(&20)));
    assert_eq!(*peak.lock().unwrap(), 2);

    assert!(runtime.flush().await);
    assert!(manager.is_empty());
    assert_eq!(manager.tracked_len(), 0);
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_higher_priority_runs_first() {
    let runtime = runtime(Some(1), 0);
    let manager = runtime.manager().build().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let log = order.clone();
    manager.add_queue_listener_default(QueueEventFn::new(move |_, event, _, _, task| {
        if event == QueueEvent::MovedToRun {
            log.lock().unwrap().push(task.name().to_string());
        }
    }));

    let (listener, mut rx) = ChannelListener::new();
    let gate = sleeper(&runtime, "gate", 5, 100);
    let low = sleeper(&runtime, "low", 2, 1);
    let high = sleeper(&runtime, "high", 9, 1);
    let mid = sleeper(&runtime, "mid", 5, 1);
    for task in [&gate, &low, &high, &mid] {
        task.add_listener_default(listener.clone());
        assert!(manager.add_task(task));
    }
    assert_eq!(manager.run_len(), 1);
    assert_eq!(manager.ready_len(), 3);
    assert!(gate.is_running());

    let finished = wait_terminal(&mut rx, 4).await;
    assert_eq!(*order.lock().unwrap(), vec!["gate", "high", "mid", "low"]);
    assert!(finished.iter().all(|t| t.error().is_none()));
    assert_eq!(gate.result_as::<u64>().as_deref(), Some(&100));
    assert_eq!(low.result_as::<u64>().as_deref(), Some(&1));
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_failed_tasks_stay_watched() {
    let runtime = runtime(None, 4);
    let manager = runtime
        .manager()
        .watch_filter(|_, _, _, error| error.is_some())
        .build()
        .unwrap();

    let (listener, mut rx) = ChannelListener::new();
    let mut failing = Vec::new();
    for i in 0..6 {
        let fails = i % 2 == 0;
        let task = runtime
            .task(format!("job-{i}"))
            .work(move |_| {
                if fails {
                    Err(TaskError::failed("boom"))
                } else {
                    Ok(i)
                }
            })
            .build()
            .unwrap();
        task.add_listener_default(listener.clone());
        assert!(manager.add_task_with(&task, TaskKey::of(&task), "batch", None));
        if fails {
            failing.push(task.id());
        }
    }

    wait_terminal(&mut rx, 6).await;
    assert!(runtime.flush().await);

    let mut watched: Vec<_> = manager.watched_tasks().iter().map(|t| t.id()).collect();
    watched.sort_unstable();
    assert_eq!(watched, failing);
    assert_eq!(manager.tasks_of_type("batch").len(), 3);
    runtime.shutdown();
}
