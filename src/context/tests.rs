use super::*;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[test]
fn test_dispatcher_runs_jobs_in_fifo_order() {
    let dispatcher = Dispatcher::spawn("fifo").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let seen = seen.clone();
        assert!(dispatcher.post(Box::new(move || seen.lock().unwrap().push(i))));
    }
    assert!(dispatcher.flush_blocking());

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_dispatcher_reports_current_context() {
    let dispatcher = Dispatcher::spawn("current").unwrap();
    assert!(!dispatcher.is_current());

    let on_context = Arc::new(AtomicBool::new(false));
    let flag = on_context.clone();
    let inner = dispatcher.clone();
    dispatcher.post(Box::new(move || {
        flag.store(inner.is_current(), Ordering::SeqCst);
    }));
    assert!(dispatcher.flush_blocking());
    assert!(on_context.load(Ordering::SeqCst));
}

#[test]
fn test_dispatcher_rejects_jobs_after_shutdown() {
    let dispatcher = Dispatcher::spawn("closing").unwrap();
    assert!(dispatcher.is_running());

    dispatcher.shutdown();
    assert!(!dispatcher.is_running());
    assert!(!dispatcher.post(Box::new(|| {})));
    assert!(!dispatcher.flush_blocking());
}

#[test]
fn test_dispatcher_survives_panicking_job() {
    let dispatcher = Dispatcher::spawn("panicky").unwrap();
    let ran = Arc::new(AtomicBool::new(false));

    dispatcher.post(Box::new(|| panic!("listener bug")));
    let flag = ran.clone();
    dispatcher.post(Box::new(move || flag.store(true, Ordering::SeqCst)));

    assert!(dispatcher.flush_blocking());
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_dispatcher_async_flush() {
    let dispatcher = Dispatcher::spawn("async-flush").unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    dispatcher.post(Box::new(move || flag.store(true, Ordering::SeqCst)));

    assert!(dispatcher.flush().await);
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_context_ids_are_unique() {
    let a = Dispatcher::spawn("a").unwrap();
    let b = Dispatcher::spawn("b").unwrap();
    assert_ne!(a.id(), b.id());
}
