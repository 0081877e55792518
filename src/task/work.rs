use crate::task::state::TaskRef;
use crate::task::types::*;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;

/// Body of a task, executed exactly once on the task's own thread.
///
/// `Ok(None)` completes the task without a result value.
pub trait Work: Send + 'static {
    fn run(self: Box<Self>, ctx: &WorkContext) -> Result<Option<TaskOutput>, TaskError>;
}

/// [`Work`] adapter for closures returning a plain value
pub(crate) struct FnWork<F>(pub(crate) F);

impl<F, T, E> Work for FnWork<F>
where
    F: FnOnce(&WorkContext) -> Result<T, E> + Send + 'static,
    T: Any + Send + Sync,
    E: Into<TaskError>,
{
    fn run(self: Box<Self>, ctx: &WorkContext) -> Result<Option<TaskOutput>, TaskError> {
        match (self.0)(ctx) {
            Ok(value) => Ok(Some(Arc::new(value) as TaskOutput)),
            Err(err) => Err(err.into()),
        }
    }
}

/// Handle given to a work body.
///
/// Exposes cooperative interruption and progress publishing. Blocking helpers
/// run on a current-thread tokio runtime that is created on first use, so they
/// must not be called from inside another async runtime.
pub struct WorkContext {
    task: TaskRef,
    runtime: OnceLock<Runtime>,
}

impl WorkContext {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self {
            task,
            runtime: OnceLock::new(),
        }
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    /// Whether the task was cancelled with interrupt
    pub fn is_interrupted(&self) -> bool {
        self.task.is_interrupted()
    }

    /// `Err(TaskError::Interrupted)` once an interrupt was requested
    pub fn check_interrupted(&self) -> Result<(), TaskError> {
        if self.is_interrupted() {
            Err(TaskError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Token tripped by an interrupting cancel
    pub fn interrupted(&self) -> CancellationToken {
        self.task.interrupt_token()
    }

    pub fn publish_progress_init(&self, max: i64) {
        self.task.publish_progress_init(max);
    }

    pub fn publish_progress(&self, progress: i64) {
        self.task.publish_progress(progress);
    }

    /// Sleep for `duration`, returning early with `Interrupted`
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        // Timers bind to the runtime current at creation.
        self.block_on(async move { tokio::time::sleep(duration).await })
    }

    /// Drive `future` to completion unless the task is interrupted first.
    ///
    /// The future is polled inside the context runtime, but it is built by the
    /// caller: create timers and I/O resources inside an `async` block.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, TaskError> {
        let token = self.interrupted();
        if token.is_cancelled() {
            return Err(TaskError::Interrupted);
        }
        let runtime = self.runtime()?;
        runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(TaskError::Interrupted),
                output = future => Ok(output),
            }
        })
    }

    fn runtime(&self) -> Result<&Runtime, TaskError> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(self.runtime.get_or_init(|| runtime))
    }
}
