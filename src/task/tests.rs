use super::*;
use crate::context::{Dispatcher, OwnerContext};
use crate::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

type Events = Arc<Mutex<Vec<TaskEvent>>>;

fn recorder() -> (ListenerRef, Events) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let listener: ListenerRef = EventFn::new(move |_task, event| sink.lock().unwrap().push(event));
    (listener, events)
}

fn kinds(events: &Events) -> Vec<TaskEventKind> {
    events.lock().unwrap().iter().map(TaskEvent::kind).collect()
}

fn wait_terminated(task: &TaskRef, owner: &Dispatcher) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !task.is_terminated() {
        assert!(Instant::now() < deadline, "{} never terminated", task.unique_name());
        thread::sleep(Duration::from_millis(5));
    }
    assert!(owner.flush_blocking());
}

fn simple_task(owner: &Arc<Dispatcher>, value: u32) -> TaskRef {
    Task::builder("simple")
        .owner(owner.clone())
        .work(move |_ctx| Ok::<_, TaskError>(value))
        .build()
        .unwrap()
}

#[test]
fn test_task_runs_and_reports_result() {
    let owner = Dispatcher::spawn("run").unwrap();
    let task = simple_task(&owner, 42);
    let (listener, events) = recorder();
    assert!(task.add_listener_default(listener));

    assert!(task.is_ready());
    assert!(task.start());
    wait_terminated(&task, &owner);

    assert_eq!(kinds(&events), vec![TaskEventKind::Started, TaskEventKind::PostRun]);
    assert_eq!(task.state(), TaskState::Terminated);
    assert_eq!(*task.result_as::<u32>().unwrap(), 42);
    assert!(task.error().is_none());
    assert!(task.finished_at().is_some());

    let events = events.lock().unwrap();
    match &events[1] {
        TaskEvent::PostRun { result, error } => {
            assert!(error.is_none());
            assert_eq!(result.as_ref().unwrap().downcast_ref::<u32>(), Some(&42));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_task_starts_only_once() {
    let owner = Dispatcher::spawn("once").unwrap();
    let task = simple_task(&owner, 1);
    assert!(task.start());
    assert!(!task.start());
    wait_terminated(&task, &owner);
    assert!(!task.start());
}

#[test]
fn test_cancel_ready_task_is_synchronous() {
    let owner = Dispatcher::spawn("cancel-ready").unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let task = Task::builder("never")
        .owner(owner.clone())
        .work(move |_ctx| {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, TaskError>(())
        })
        .build()
        .unwrap();
    let (listener, events) = recorder();
    task.add_listener_default(listener);

    assert!(task.cancel(None, true));
    assert_eq!(task.state(), TaskState::Cancelled);
    assert!(!task.start());
    assert!(!task.cancel(None, true));

    wait_terminated(&task, &owner);
    assert_eq!(task.state(), TaskState::TerminatedCancelled);
    assert!(!ran.load(Ordering::SeqCst));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], TaskEvent::Cancel { started: false, param: None }));
    assert!(matches!(events[1], TaskEvent::Cancelled { error: None, param: None }));
}

#[test]
fn test_cancel_running_task_interrupts_body() {
    let owner = Dispatcher::spawn("cancel-running").unwrap();
    let (entered_tx, entered_rx) = mpsc::channel();
    let task = Task::builder("sleeper")
        .owner(owner.clone())
        .work(move |ctx| {
            entered_tx.send(()).unwrap();
            ctx.sleep(Duration::from_secs(30))?;
            Ok::<_, TaskError>(())
        })
        .build()
        .unwrap();
    let (listener, events) = recorder();
    task.add_listener_default(listener);

    assert!(task.start());
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(task.cancel(None, true));
    assert!(task.is_interrupted());
    assert_eq!(task.state(), TaskState::Cancelling);

    wait_terminated(&task, &owner);
    assert_eq!(task.state(), TaskState::TerminatedCancelled);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], TaskEvent::Started));
    assert!(matches!(events[1], TaskEvent::Cancel { started: true, .. }));
    match &events[2] {
        TaskEvent::Cancelled { error, .. } => {
            assert!(error.as_ref().unwrap().is_interrupted())
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_sleeping_body_completes() {
    let owner = Dispatcher::spawn("sleep-ok").unwrap();
    let task = Task::builder("napper")
        .owner(owner.clone())
        .work(|ctx| {
            let started = Instant::now();
            ctx.sleep(Duration::from_millis(20))?;
            let waited = ctx.block_on(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                7u32
            })?;
            assert!(started.elapsed() >= Duration::from_millis(25));
            Ok::<_, TaskError>(waited)
        })
        .build()
        .unwrap();

    assert_eq!(
        task.start_sync().unwrap().and_then(|r| r.downcast::<u32>().ok()).as_deref(),
        Some(&7)
    );
    assert!(task.error().is_none());
    wait_terminated(&task, &owner);
    assert_eq!(task.state(), TaskState::Terminated);
}

#[test]
fn test_cancel_without_interrupt_lets_body_finish() {
    let owner = Dispatcher::spawn("cancel-soft").unwrap();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let task = Task::builder("soft")
        .owner(owner.clone())
        .work(move |ctx| {
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok::<_, TaskError>(ctx.is_interrupted())
        })
        .build()
        .unwrap();
    let (listener, events) = recorder();
    task.add_listener_default(listener);

    task.start();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(task.cancel(None, false));
    assert!(!task.is_interrupted());
    release_tx.send(()).unwrap();

    wait_terminated(&task, &owner);
    assert_eq!(
        kinds(&events),
        vec![TaskEventKind::Started, TaskEventKind::Cancel, TaskEventKind::Cancelled]
    );
    assert!(!*task.result_as::<bool>().unwrap());
}

#[test]
fn test_cancel_after_done_has_no_effect() {
    let owner = Dispatcher::spawn("cancel-done").unwrap();
    let task = simple_task(&owner, 7);
    let (listener, events) = recorder();
    task.add_listener_default(listener);

    task.start();
    wait_terminated(&task, &owner);
    assert!(!task.cancel(None, true));
    assert!(!task.cancel_default());
    assert!(owner.flush_blocking());

    assert_eq!(kinds(&events), vec![TaskEventKind::Started, TaskEventKind::PostRun]);
    assert_eq!(task.state(), TaskState::Terminated);
    assert!(task.cancel_param().is_none());
}

#[test]
fn test_body_error_is_delivered() {
    let owner = Dispatcher::spawn("error").unwrap();
    let task = Task::builder("failing")
        .owner(owner.clone())
        .work(|_ctx| Err::<(), _>(TaskError::failed("disk full")))
        .build()
        .unwrap();
    let (listener, events) = recorder();
    task.add_listener_default(listener);

    task.start();
    wait_terminated(&task, &owner);

    assert!(task.result().is_none());
    assert!(matches!(task.error(), Some(TaskError::Failed { message }) if message == "disk full"));
    let events = events.lock().unwrap();
    assert!(matches!(&events[1], TaskEvent::PostRun { result: None, error: Some(_) }));
}

#[test]
fn test_anyhow_error_is_wrapped() {
    let owner = Dispatcher::spawn("anyhow").unwrap();
    let task = Task::builder("anyhow")
        .owner(owner.clone())
        .work(|_ctx| -> anyhow::Result<()> { anyhow::bail!("boom") })
        .build()
        .unwrap();

    task.start();
    wait_terminated(&task, &owner);
    let err = task.error().unwrap();
    assert!(matches!(err, TaskError::Other(_)));
    assert_eq!(err.to_string(), "boom");
}

#[test]
fn test_panic_in_body_is_captured() {
    let owner = Dispatcher::spawn("panic").unwrap();
    let task = Task::builder("panicky")
        .owner(owner.clone())
        .work(|_ctx| -> Result<(), TaskError> { panic!("kaboom") })
        .build()
        .unwrap();

    task.start();
    wait_terminated(&task, &owner);
    assert!(matches!(task.error(), Some(TaskError::Panicked { message }) if message == "kaboom"));
}

#[test]
fn test_start_sync_returns_result_and_rejects_restart() {
    let owner = Dispatcher::spawn("sync").unwrap();
    let task = simple_task(&owner, 5);
    let (listener, events) = recorder();
    task.add_listener_default(listener);

    let result = task.start_sync().unwrap().unwrap();
    assert_eq!(result.downcast_ref::<u32>(), Some(&5));
    assert!(matches!(task.start_sync(), Err(TaskError::BadState(_))));

    wait_terminated(&task, &owner);
    assert_eq!(kinds(&events), vec![TaskEventKind::Started, TaskEventKind::PostRun]);
}

#[test]
fn test_start_sync_reraises_error() {
    let owner = Dispatcher::spawn("sync-error").unwrap();
    let task = Task::builder("sync-failing")
        .owner(owner.clone())
        .work(|_ctx| Err::<(), _>(TaskError::failed("nope")))
        .build()
        .unwrap();

    let err = task.start_sync().unwrap_err();
    assert!(matches!(err, TaskError::Failed { .. }));
}

#[test]
fn test_progress_is_clamped_and_throttled() {
    let owner = Dispatcher::spawn("progress").unwrap();
    let task = Task::builder("progress")
        .owner(owner.clone())
        .progress_interval(Duration::from_secs(60))
        .work(|ctx| {
            ctx.publish_progress_init(100);
            ctx.publish_progress(150);
            ctx.publish_progress(100);
            ctx.publish_progress(50);
            Ok::<_, TaskError>(())
        })
        .build()
        .unwrap();
    let (listener, events) = recorder();
    task.add_listener_default(listener);

    task.start();
    wait_terminated(&task, &owner);

    let progress: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            TaskEvent::ProgressInit { max } => Some(("init", *max)),
            TaskEvent::Progress { progress } => Some(("progress", *progress)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![("init", 100), ("progress", 100), ("progress", 50)]);
    assert_eq!(task.max_progress(), Some(100));
    assert_eq!(task.current_progress(), Some(50));
}

#[test]
fn test_late_listener_gets_progress_replay() {
    let owner = Dispatcher::spawn("replay").unwrap();
    let (reported_tx, reported_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let task = Task::builder("replay")
        .owner(owner.clone())
        .work(move |ctx| {
            ctx.publish_progress_init(10);
            ctx.publish_progress(4);
            reported_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok::<_, TaskError>(())
        })
        .build()
        .unwrap();

    task.start();
    reported_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(task.is_progress_started());
    assert!(owner.flush_blocking());

    let (listener, events) = recorder();
    assert!(task.add_listener_with_progress(owner.clone(), listener, true));
    assert!(owner.flush_blocking());
    {
        let events = events.lock().unwrap();
        assert!(matches!(events[0], TaskEvent::ProgressInit { max: 10 }));
        assert!(matches!(events[1], TaskEvent::Progress { progress: 4 }));
    }

    release_tx.send(()).unwrap();
    wait_terminated(&task, &owner);
    assert_eq!(kinds(&events).last(), Some(&TaskEventKind::PostRun));
}

#[test]
fn test_progress_replay_precedes_later_progress() {
    let owner = Dispatcher::spawn("replay-order").unwrap();
    let listener_owner = Dispatcher::spawn("replay-order-listener").unwrap();
    let (reported_tx, reported_rx) = mpsc::channel();
    let (step_tx, step_rx) = mpsc::channel::<()>();
    let task = Task::builder("replay-order")
        .owner(owner.clone())
        .work(move |ctx| {
            ctx.publish_progress_init(10);
            ctx.publish_progress(4);
            reported_tx.send(()).unwrap();
            step_rx.recv().unwrap();
            ctx.publish_progress(6);
            reported_tx.send(()).unwrap();
            step_rx.recv().unwrap();
            Ok::<_, TaskError>(())
        })
        .build()
        .unwrap();

    task.start();
    reported_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(owner.flush_blocking());

    // Hold the listener's context so both deliveries queue up behind it.
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    assert!(listener_owner.post(Box::new(move || {
        let _ = gate_rx.recv();
    })));
    let (listener, events) = recorder();
    assert!(task.add_listener_with_progress(listener_owner.clone(), listener, true));

    step_tx.send(()).unwrap();
    reported_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(owner.flush_blocking());
    gate_tx.send(()).unwrap();
    assert!(listener_owner.flush_blocking());
    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TaskEvent::ProgressInit { max: 10 }));
        assert!(matches!(events[1], TaskEvent::Progress { progress: 4 }));
        assert!(matches!(events[2], TaskEvent::Progress { progress: 6 }));
    }

    step_tx.send(()).unwrap();
    wait_terminated(&task, &owner);
    assert!(listener_owner.flush_blocking());
    assert_eq!(kinds(&events).last(), Some(&TaskEventKind::PostRun));
}

#[test]
fn test_duplicate_listener_is_rejected() {
    let owner = Dispatcher::spawn("dup").unwrap();
    let other = Dispatcher::spawn("dup-other").unwrap();
    let task = simple_task(&owner, 0);
    let (listener, _events) = recorder();

    assert!(task.add_listener_default(listener.clone()));
    assert!(!task.add_listener(other.clone(), listener.clone()));
    assert_eq!(task.listener_count(), 1);

    assert!(task.remove_listener(&listener));
    assert!(!task.remove_listener(&listener));
    assert_eq!(task.listener_count(), 0);

    let (second, _events) = recorder();
    assert!(task.add_listener_default(listener));
    assert!(task.add_listener(other, second));
    task.clear_listeners();
    assert_eq!(task.listener_count(), 0);
}

#[test]
fn test_listener_runs_on_its_own_context() {
    let owner = Dispatcher::spawn("task-owner").unwrap();
    let listener_ctx = Dispatcher::spawn("listener-owner").unwrap();
    let task = simple_task(&owner, 0);

    let on_listener_ctx = Arc::new(Mutex::new(Vec::new()));
    let seen = on_listener_ctx.clone();
    let ctx = listener_ctx.clone();
    task.add_listener(
        listener_ctx.clone(),
        EventFn::new(move |_task, _event| seen.lock().unwrap().push(ctx.is_current())),
    );

    task.start();
    wait_terminated(&task, &owner);
    assert!(listener_ctx.flush_blocking());
    let seen = on_listener_ctx.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|on_ctx| *on_ctx));
}

#[test]
fn test_cancel_param_is_forwarded_unchanged() {
    let owner = Dispatcher::spawn("param").unwrap();
    let task = simple_task(&owner, 0);
    let (listener, events) = recorder();
    task.add_listener_default(listener);

    let param: CancelParam = Arc::new("user request".to_string());
    assert!(task.cancel_with(param.clone()));
    assert!(!task.cancel_with(Arc::new("second".to_string())));
    wait_terminated(&task, &owner);

    assert!(Arc::ptr_eq(&task.cancel_param().unwrap(), &param));
    for event in events.lock().unwrap().iter() {
        assert!(Arc::ptr_eq(event.cancel_param().unwrap(), &param));
    }
}

struct TraceHooks(Arc<Mutex<Vec<&'static str>>>);

impl TaskHooks for TraceHooks {
    fn on_early_post_run(&self, _task: &TaskRef, _result: Option<&TaskOutput>, _error: Option<&TaskError>) {
        self.0.lock().unwrap().push("early");
    }

    fn on_late_post_run(&self, _task: &TaskRef, _result: Option<&TaskOutput>, _error: Option<&TaskError>) {
        self.0.lock().unwrap().push("late");
    }
}

#[test]
fn test_hooks_wrap_listener_dispatch() {
    let owner = Dispatcher::spawn("hooks").unwrap();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let task = Task::builder("hooked")
        .owner(owner.clone())
        .hooks(TraceHooks(trace.clone()))
        .work(|_ctx| Ok::<_, TaskError>(()))
        .build()
        .unwrap();

    let sink = trace.clone();
    task.add_listener_default(EventFn::new(move |_task, event| {
        if event.kind() == TaskEventKind::PostRun {
            sink.lock().unwrap().push("listener");
        }
    }));

    task.start();
    wait_terminated(&task, &owner);
    assert_eq!(*trace.lock().unwrap(), vec!["early", "late", "listener"]);
}

#[test]
fn test_task_tags() {
    let owner = Dispatcher::spawn("tags").unwrap();
    let task = simple_task(&owner, 0);

    assert!(task.set_tag("url", Arc::new("https://example.org".to_string())).is_none());
    let tag = task.tag("url").unwrap();
    assert_eq!(tag.downcast_ref::<String>().unwrap(), "https://example.org");
    assert!(task.remove_tag("url").is_some());
    assert!(task.tag("url").is_none());
}

#[test]
fn test_task_ids_increase() {
    let owner = Dispatcher::spawn("ids").unwrap();
    let a = simple_task(&owner, 0);
    let b = simple_task(&owner, 0);
    assert!(b.id() > a.id());
    assert_eq!(a.unique_name(), format!("simple({})", a.id()));
}

#[test]
fn test_builder_requires_owner_and_work() {
    let missing_owner = Task::builder("orphan").work(|_ctx| Ok::<_, TaskError>(())).build();
    assert!(matches!(missing_owner, Err(Error::MissingOwner(name)) if name == "orphan"));

    let owner = Dispatcher::spawn("builder").unwrap();
    let missing_work = Task::builder("idle").owner(owner).build();
    assert!(matches!(missing_work, Err(Error::MissingWork(_))));
}

#[test]
fn test_priority_range() {
    assert!(Priority::new(0).is_err());
    assert!(Priority::new(11).is_err());
    assert_eq!(Priority::new(7).unwrap(), Priority::MID_HIGH);
    assert_eq!(Priority::default(), Priority::NORM);
    assert!(Priority::MAX > Priority::MIN);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_listener_streams_events() {
    let owner = Dispatcher::spawn("channel").unwrap();
    let task = simple_task(&owner, 3);
    let (listener, mut rx) = ChannelListener::new();
    task.add_listener_default(listener);
    task.start();

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.event.kind(), TaskEventKind::Started);
    assert_eq!(first.task.id(), task.id());

    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.event.kind(), TaskEventKind::PostRun);
}
