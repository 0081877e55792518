use crate::util::lock;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct ProgressState {
    max: Option<i64>,
    last: Option<i64>,
    last_at: Option<Instant>,
}

/// Throttled progress bookkeeping of one task.
///
/// A report is dropped only when it arrives within `min_interval` of the last
/// accepted one and carries the same value.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    started: AtomicBool,
    min_interval: Duration,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            started: AtomicBool::new(false),
            min_interval,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Record the maximum. Returns `false` if progress was already initialized.
    pub(crate) fn init(&self, max: i64) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut state = lock(&self.state);
        state.max = Some(max);
        state.last = Some(0);
        state.last_at = Some(Instant::now());
        true
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Clamp `progress` to the maximum and decide whether it is reported.
    pub(crate) fn accept(&self, progress: i64) -> Option<i64> {
        let mut state = lock(&self.state);
        let progress = match state.max {
            Some(max) => progress.min(max),
            None => progress,
        };

        let now = Instant::now();
        let recent = state
            .last_at
            .is_some_and(|at| now.duration_since(at) < self.min_interval);
        if recent && state.last == Some(progress) {
            return None;
        }

        state.last = Some(progress);
        state.last_at = Some(now);
        Some(progress)
    }

    pub(crate) fn max(&self) -> Option<i64> {
        lock(&self.state).max
    }

    pub(crate) fn current(&self) -> Option<i64> {
        lock(&self.state).last
    }
}
