use crate::task::listener::TaskEvent;
use crate::task::state::TaskRef;
use crate::task::types::*;

/// Subtype extension points around every lifecycle event.
///
/// Early hooks run on the task owner before listeners are notified, late
/// hooks right after the listener jobs have been posted. Typical uses are
/// resource cleanup tied to a task kind, e.g. removing a temp file once a
/// download is cancelled.
pub trait TaskHooks: Send + Sync {
    fn on_early_started(&self, _task: &TaskRef) {}
    fn on_late_started(&self, _task: &TaskRef) {}

    fn on_early_post_run(&self, _task: &TaskRef, _result: Option<&TaskOutput>, _error: Option<&TaskError>) {}
    fn on_late_post_run(&self, _task: &TaskRef, _result: Option<&TaskOutput>, _error: Option<&TaskError>) {}

    fn on_early_cancel(&self, _task: &TaskRef, _started: bool, _param: Option<&CancelParam>) {}
    fn on_late_cancel(&self, _task: &TaskRef, _started: bool, _param: Option<&CancelParam>) {}

    fn on_early_cancelled(&self, _task: &TaskRef, _error: Option<&TaskError>, _param: Option<&CancelParam>) {}
    fn on_late_cancelled(&self, _task: &TaskRef, _error: Option<&TaskError>, _param: Option<&CancelParam>) {}

    fn on_early_progress_init(&self, _task: &TaskRef, _max: i64) {}
    fn on_late_progress_init(&self, _task: &TaskRef, _max: i64) {}

    fn on_early_progress(&self, _task: &TaskRef, _progress: i64) {}
    fn on_late_progress(&self, _task: &TaskRef, _progress: i64) {}
}

/// Hooks of a task that customizes nothing
pub(crate) struct NoHooks;

impl TaskHooks for NoHooks {}

pub(crate) fn run_early(hooks: &dyn TaskHooks, task: &TaskRef, event: &TaskEvent) {
    match event {
        TaskEvent::Started => hooks.on_early_started(task),
        TaskEvent::PostRun { result, error } => {
            hooks.on_early_post_run(task, result.as_ref(), error.as_ref())
        }
        TaskEvent::Cancel { started, param } => hooks.on_early_cancel(task, *started, param.as_ref()),
        TaskEvent::Cancelled { error, param } => {
            hooks.on_early_cancelled(task, error.as_ref(), param.as_ref())
        }
        TaskEvent::ProgressInit { max } => hooks.on_early_progress_init(task, *max),
        TaskEvent::Progress { progress } => hooks.on_early_progress(task, *progress),
    }
}

pub(crate) fn run_late(hooks: &dyn TaskHooks, task: &TaskRef, event: &TaskEvent) {
    match event {
        TaskEvent::Started => hooks.on_late_started(task),
        TaskEvent::PostRun { result, error } => {
            hooks.on_late_post_run(task, result.as_ref(), error.as_ref())
        }
        TaskEvent::Cancel { started, param } => hooks.on_late_cancel(task, *started, param.as_ref()),
        TaskEvent::Cancelled { error, param } => {
            hooks.on_late_cancelled(task, error.as_ref(), param.as_ref())
        }
        TaskEvent::ProgressInit { max } => hooks.on_late_progress_init(task, *max),
        TaskEvent::Progress { progress } => hooks.on_late_progress(task, *progress),
    }
}
