use crate::context::{Owner, post_or_bug};
use crate::error::{bug, bug_on};
use crate::group::GroupCore;
use crate::manager::TaskInfo;
use crate::task::builder::TaskBuilder;
use crate::task::hooks::{self, TaskHooks};
use crate::task::listener::{
    ListenerRef, ListenerRegistry, TaskEvent, TaskEventKind, TaskListener, same_param,
};
use crate::task::progress::ProgressTracker;
use crate::task::types::*;
use crate::task::work::{Work, WorkContext};
use crate::util::{lock, panic_message};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared handle to a task
pub type TaskRef = Arc<Task>;

struct Core {
    state: TaskState,
    cancel_param: Option<CancelParam>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Outcome {
    result: Option<TaskOutput>,
    error: Option<TaskError>,
}

/// Everything a [`TaskBuilder`] resolved, ready to become a task
pub(crate) struct TaskParts {
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) owner: Owner,
    pub(crate) interrupt_on_cancel: bool,
    pub(crate) progress_interval: Duration,
    pub(crate) hooks: Box<dyn TaskHooks>,
    pub(crate) work: Box<dyn Work>,
    pub(crate) group: Option<Arc<GroupCore>>,
}

/// A unit of work executed once on its own thread, reporting its lifecycle
/// to listeners through owner contexts.
pub struct Task {
    id: TaskId,
    name: String,
    unique_name: String,
    priority: Priority,
    owner: Owner,
    interrupt_on_cancel: bool,
    created_at: DateTime<Utc>,
    core: Mutex<Core>,
    outcome: OnceLock<Outcome>,
    work: Mutex<Option<Box<dyn Work>>>,
    hooks: Box<dyn TaskHooks>,
    listeners: ListenerRegistry<dyn TaskListener>,
    progress: ProgressTracker,
    interrupt: CancellationToken,
    tags: DashMap<String, TagValue>,
    group: Option<Arc<GroupCore>>,
    manager_info: Mutex<Option<Arc<TaskInfo>>>,
    this: Weak<Task>,
}

impl Task {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub(crate) fn from_parts(parts: TaskParts) -> TaskRef {
        let id = next_task_id();
        let unique_name = format!("{}({})", parts.name, id);
        debug!(task = %unique_name, priority = %parts.priority, "Task created");
        Arc::new_cyclic(|this| Task {
            id,
            name: parts.name,
            unique_name,
            priority: parts.priority,
            owner: parts.owner,
            interrupt_on_cancel: parts.interrupt_on_cancel,
            created_at: Utc::now(),
            core: Mutex::new(Core {
                state: TaskState::Ready,
                cancel_param: None,
                finished_at: None,
            }),
            outcome: OnceLock::new(),
            work: Mutex::new(Some(parts.work)),
            hooks: parts.hooks,
            listeners: ListenerRegistry::new(),
            progress: ProgressTracker::new(parts.progress_interval),
            interrupt: CancellationToken::new(),
            tags: DashMap::new(),
            group: parts.group,
            manager_info: Mutex::new(None),
            this: this.clone(),
        })
    }

    fn this(&self) -> TaskRef {
        match self.this.upgrade() {
            Some(task) => task,
            None => bug!("{} used after its last handle was dropped", self.unique_name),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `"{name}({id})"`, the prefix of every log line about this task
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn interrupt_on_cancel(&self) -> bool {
        self.interrupt_on_cancel
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time at which the task reached `Done` or `Cancelled`
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.core).finished_at
    }

    pub fn state(&self) -> TaskState {
        lock(&self.core).state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == TaskState::Ready
    }

    /// Started and not cancelled
    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Started
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn is_cancel(&self) -> bool {
        self.state().is_cancel()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    pub fn is_owner_context(&self) -> bool {
        self.owner.is_current()
    }

    pub fn is_group(&self) -> bool {
        self.group.is_some()
    }

    pub(crate) fn group_core(&self) -> Option<&Arc<GroupCore>> {
        self.group.as_ref()
    }

    pub(crate) fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Result of the body, available once the task is done
    pub fn result(&self) -> Option<TaskOutput> {
        self.outcome.get().and_then(|o| o.result.clone())
    }

    /// Typed view of [`result`](Self::result)
    pub fn result_as<T: std::any::Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.result().and_then(|r| r.downcast::<T>().ok())
    }

    /// Error raised by the body, available once the task is done
    pub fn error(&self) -> Option<TaskError> {
        self.outcome.get().and_then(|o| o.error.clone())
    }

    pub fn cancel_param(&self) -> Option<CancelParam> {
        lock(&self.core).cancel_param.clone()
    }

    // -- tags -------------------------------------------------------------

    /// Attach an opaque value, returning the previous one for `key`
    pub fn set_tag(&self, key: impl Into<String>, value: TagValue) -> Option<TagValue> {
        self.tags.insert(key.into(), value)
    }

    pub fn tag(&self, key: &str) -> Option<TagValue> {
        self.tags.get(key).map(|v| v.value().clone())
    }

    pub fn remove_tag(&self, key: &str) -> Option<TagValue> {
        self.tags.remove(key).map(|(_, v)| v)
    }

    // -- manager binding --------------------------------------------------

    pub(crate) fn manager_info(&self) -> Option<Arc<TaskInfo>> {
        lock(&self.manager_info).clone()
    }

    pub(crate) fn set_manager_info(&self, info: Option<Arc<TaskInfo>>) {
        *lock(&self.manager_info) = info;
    }

    // -- listeners --------------------------------------------------------

    /// Register `listener`, notified on `owner`. Returns `false` for a
    /// listener that is already registered.
    pub fn add_listener(&self, owner: Owner, listener: ListenerRef) -> bool {
        self.add_listener_with_progress(owner, listener, false)
    }

    /// Register `listener` on the task's own owner context
    pub fn add_listener_default(&self, listener: ListenerRef) -> bool {
        self.add_listener(self.owner.clone(), listener)
    }

    /// Register `listener` and, with `progress_notice`, replay the current
    /// progress to it when progress already started.
    pub fn add_listener_with_progress(
        &self,
        owner: Owner,
        listener: ListenerRef,
        progress_notice: bool,
    ) -> bool {
        let added = self.listeners.add_then(owner, listener, |owner, listener| {
            if !progress_notice || !self.progress.is_started() {
                return;
            }
            if let (Some(max), Some(current)) = (self.progress.max(), self.progress.current()) {
                let task = self.this();
                let listener = listener.clone();
                post_or_bug(
                    owner.as_ref(),
                    Box::new(move || {
                        listener.on_progress_init(&task, max);
                        listener.on_progress(&task, current);
                    }),
                );
            }
        });
        if !added {
            warn!(task = %self.unique_name, "Listener already registered");
            return false;
        }
        debug!(task = %self.unique_name, "Listener added");
        true
    }

    pub fn remove_listener(&self, listener: &ListenerRef) -> bool {
        let removed = self.listeners.remove(listener);
        if removed {
            debug!(task = %self.unique_name, "Listener removed");
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drop every listener registration
    pub fn clear_listeners(&self) {
        self.listeners.clear();
        debug!(task = %self.unique_name, "Listeners cleared");
    }

    // -- lifecycle --------------------------------------------------------

    fn transition(&self, core: &mut Core, to: TaskState) {
        debug!(task = %self.unique_name, from = %core.state, to = %to, "State transition");
        core.state = to;
        if matches!(to, TaskState::Done | TaskState::Cancelled) {
            core.finished_at = Some(Utc::now());
        }
    }

    fn set_state(&self, to: TaskState) {
        let mut core = lock(&self.core);
        self.transition(&mut core, to);
    }

    /// Post `event` to the owner, where hooks and listeners get it
    fn post_event(&self, event: TaskEvent) {
        let task = self.this();
        post_or_bug(self.owner.as_ref(), Box::new(move || task.dispatch(&event)));
    }

    /// Post the terminal event and the final state change that follows it
    fn post_terminal(&self, event: TaskEvent, terminal: TaskState) {
        let task = self.this();
        post_or_bug(
            self.owner.as_ref(),
            Box::new(move || {
                task.dispatch(&event);
                task.set_state(terminal);
            }),
        );
    }

    fn dispatch(&self, event: &TaskEvent) {
        if cfg!(debug_assertions) {
            bug_on!(
                self.owner.is_current(),
                "{} dispatched {:?} off its owner context",
                self.unique_name,
                event
            );
        }
        let task = self.this();
        hooks::run_early(self.hooks.as_ref(), &task, event);
        self.listeners.post_each(|listener| {
            let task = task.clone();
            let event = event.clone();
            Box::new(move || {
                if matches!(event.kind(), TaskEventKind::Cancel | TaskEventKind::Cancelled) {
                    bug_on!(
                        same_param(event.cancel_param(), task.cancel_param().as_ref()),
                        "{} delivered a cancel param other than the recorded one",
                        task.unique_name()
                    );
                }
                event.deliver(listener.as_ref(), &task);
            })
        });
        hooks::run_late(self.hooks.as_ref(), &task, event);
    }

    /// Launch the body on a dedicated thread.
    ///
    /// Returns `false` unless the task is `Ready`.
    pub fn start(&self) -> bool {
        {
            let mut core = lock(&self.core);
            if core.state != TaskState::Ready {
                debug!(task = %self.unique_name, state = %core.state, "Start rejected");
                return false;
            }
            self.transition(&mut core, TaskState::Started);
            self.post_event(TaskEvent::Started);
        }

        let task = self.this();
        let spawned = thread::Builder::new()
            .name(self.unique_name.clone())
            .spawn(move || task.bg_run());
        if let Err(err) = spawned {
            warn!(task = %self.unique_name, "Failed to spawn task thread: {}", err);
            lock(&self.work).take();
            self.complete(
                None,
                Some(TaskError::Spawn {
                    message: err.to_string(),
                }),
            );
        }
        true
    }

    /// Run the body on the calling thread.
    ///
    /// Listeners are notified as for [`start`](Self::start). The captured
    /// error is returned instead of being swallowed.
    pub fn start_sync(&self) -> Result<Option<TaskOutput>, TaskError> {
        {
            let mut core = lock(&self.core);
            if core.state != TaskState::Ready {
                return Err(TaskError::BadState(core.state));
            }
            self.transition(&mut core, TaskState::Started);
            self.post_event(TaskEvent::Started);
        }

        self.bg_run();
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self.result()),
        }
    }

    /// Request cancellation using the task's `interrupt_on_cancel` default
    pub fn cancel_default(&self) -> bool {
        self.cancel(None, self.interrupt_on_cancel)
    }

    /// Cancel with `param` using the task's `interrupt_on_cancel` default
    pub fn cancel_with(&self, param: CancelParam) -> bool {
        self.cancel(Some(param), self.interrupt_on_cancel)
    }

    /// Cancel the task.
    ///
    /// A ready task is cancelled synchronously. A started task is only
    /// flagged; with `interrupt` its body is also interrupted. Returns `false`
    /// once the task is cancelling or done.
    pub fn cancel(&self, param: Option<CancelParam>, interrupt: bool) -> bool {
        let mut core = lock(&self.core);
        let started = match core.state {
            TaskState::Ready => false,
            TaskState::Started => true,
            state => {
                debug!(task = %self.unique_name, state = %state, "Cancel rejected");
                return false;
            }
        };

        self.transition(&mut core, TaskState::Cancelling);
        core.cancel_param = param.clone();
        self.post_event(TaskEvent::Cancel {
            started,
            param: param.clone(),
        });

        if started {
            if interrupt {
                debug!(task = %self.unique_name, "Interrupting task thread");
                self.interrupt.cancel();
            }
            return true;
        }

        self.transition(&mut core, TaskState::Cancelled);
        if self.outcome.set(Outcome::default()).is_err() {
            bug!("{} outcome recorded before it ever started", self.unique_name);
        }
        self.post_terminal(TaskEvent::Cancelled { error: None, param }, TaskState::TerminatedCancelled);
        drop(core);

        lock(&self.work).take();
        true
    }

    fn bg_run(&self) {
        let work = lock(&self.work).take();
        let skip = match self.state() {
            TaskState::Cancelling => true,
            TaskState::Started => false,
            state => bug!("{} body launched in state {}", self.unique_name, state),
        };

        let (result, error) = match work {
            _ if skip => {
                debug!(task = %self.unique_name, "Cancelled before the body ran");
                (None, None)
            }
            None => bug!("{} has no work body", self.unique_name),
            Some(work) => {
                let ctx = WorkContext::new(self.this());
                match panic::catch_unwind(AssertUnwindSafe(|| work.run(&ctx))) {
                    Ok(Ok(result)) => (result, None),
                    Ok(Err(err)) => {
                        debug!(task = %self.unique_name, "Body failed: {}", err);
                        (None, Some(err))
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        warn!(task = %self.unique_name, "Body panicked: {}", message);
                        (None, Some(TaskError::Panicked { message }))
                    }
                }
            }
        };

        self.complete(result, error);
    }

    fn complete(&self, result: Option<TaskOutput>, error: Option<TaskError>) {
        let outcome = Outcome {
            result: result.clone(),
            error: error.clone(),
        };
        if self.outcome.set(outcome).is_err() {
            bug!("{} completed twice", self.unique_name);
        }

        let mut core = lock(&self.core);
        match core.state {
            TaskState::Cancelling => {
                self.transition(&mut core, TaskState::Cancelled);
                let param = core.cancel_param.clone();
                self.post_terminal(TaskEvent::Cancelled { error, param }, TaskState::TerminatedCancelled);
            }
            TaskState::Started => {
                self.transition(&mut core, TaskState::Done);
                self.post_terminal(TaskEvent::PostRun { result, error }, TaskState::Terminated);
            }
            state => bug!("{} finished its body in state {}", self.unique_name, state),
        }
    }

    // -- progress ---------------------------------------------------------

    /// Announce the progress maximum. Call once, from the body, before any
    /// [`publish_progress`](Self::publish_progress).
    pub fn publish_progress_init(&self, max: i64) {
        let first = self.progress.init(max);
        bug_on!(
            first && self.is_active(),
            "{} progress init published twice or outside the body",
            self.unique_name
        );
        self.post_event(TaskEvent::ProgressInit { max });
    }

    /// Report progress, clamped to the maximum and throttled
    pub fn publish_progress(&self, progress: i64) {
        bug_on!(
            self.progress.is_started() && self.is_active(),
            "{} progress published before init or outside the body",
            self.unique_name
        );
        if let Some(progress) = self.progress.accept(progress) {
            self.post_event(TaskEvent::Progress { progress });
        }
    }

    pub fn is_progress_started(&self) -> bool {
        self.progress.is_started()
    }

    pub fn max_progress(&self) -> Option<i64> {
        self.progress.max()
    }

    /// Last reported progress value
    pub fn current_progress(&self) -> Option<i64> {
        self.progress.current()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_name)
    }
}
