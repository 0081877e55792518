use crate::context::{Owner, post_or_bug};
use crate::task::state::TaskRef;
use crate::task::types::*;
use crate::util::lock;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Receiver of task lifecycle events.
///
/// Every handler is optional. Handlers run on the owner context the listener
/// was registered with, never on the thread raising the event.
pub trait TaskListener: Send + Sync {
    fn on_started(&self, _task: &TaskRef) {}

    fn on_post_run(&self, _task: &TaskRef, _result: Option<&TaskOutput>, _error: Option<&TaskError>) {}

    /// `started` tells whether the background body was already launched
    fn on_cancel(&self, _task: &TaskRef, _started: bool, _param: Option<&CancelParam>) {}

    fn on_cancelled(&self, _task: &TaskRef, _error: Option<&TaskError>, _param: Option<&CancelParam>) {}

    fn on_progress_init(&self, _task: &TaskRef, _max: i64) {}

    fn on_progress(&self, _task: &TaskRef, _progress: i64) {}
}

/// Shared handle to a registered listener; identity is the allocation
pub type ListenerRef = Arc<dyn TaskListener>;

/// Tagged form of the [`TaskListener`] callbacks
#[derive(Clone)]
pub enum TaskEvent {
    Started,
    PostRun {
        result: Option<TaskOutput>,
        error: Option<TaskError>,
    },
    Cancel {
        started: bool,
        param: Option<CancelParam>,
    },
    Cancelled {
        error: Option<TaskError>,
        param: Option<CancelParam>,
    },
    ProgressInit {
        max: i64,
    },
    Progress {
        progress: i64,
    },
}

/// Payload-free discriminant of [`TaskEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEventKind {
    Started,
    PostRun,
    Cancel,
    Cancelled,
    ProgressInit,
    Progress,
}

impl TaskEvent {
    pub fn kind(&self) -> TaskEventKind {
        match self {
            TaskEvent::Started => TaskEventKind::Started,
            TaskEvent::PostRun { .. } => TaskEventKind::PostRun,
            TaskEvent::Cancel { .. } => TaskEventKind::Cancel,
            TaskEvent::Cancelled { .. } => TaskEventKind::Cancelled,
            TaskEvent::ProgressInit { .. } => TaskEventKind::ProgressInit,
            TaskEvent::Progress { .. } => TaskEventKind::Progress,
        }
    }

    /// Error carried by a terminal event
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskEvent::PostRun { error, .. } | TaskEvent::Cancelled { error, .. } => error.as_ref(),
            _ => None,
        }
    }

    /// Cancel parameter carried by a cancellation event
    pub fn cancel_param(&self) -> Option<&CancelParam> {
        match self {
            TaskEvent::Cancel { param, .. } | TaskEvent::Cancelled { param, .. } => param.as_ref(),
            _ => None,
        }
    }

    /// Invoke the matching handler of `listener`
    pub fn deliver(&self, listener: &dyn TaskListener, task: &TaskRef) {
        match self {
            TaskEvent::Started => listener.on_started(task),
            TaskEvent::PostRun { result, error } => {
                listener.on_post_run(task, result.as_ref(), error.as_ref())
            }
            TaskEvent::Cancel { started, param } => listener.on_cancel(task, *started, param.as_ref()),
            TaskEvent::Cancelled { error, param } => {
                listener.on_cancelled(task, error.as_ref(), param.as_ref())
            }
            TaskEvent::ProgressInit { max } => listener.on_progress_init(task, *max),
            TaskEvent::Progress { progress } => listener.on_progress(task, *progress),
        }
    }
}

impl fmt::Debug for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEvent::Started => write!(f, "Started"),
            TaskEvent::PostRun { result, error } => f
                .debug_struct("PostRun")
                .field("has_result", &result.is_some())
                .field("error", error)
                .finish(),
            TaskEvent::Cancel { started, param } => f
                .debug_struct("Cancel")
                .field("started", started)
                .field("has_param", &param.is_some())
                .finish(),
            TaskEvent::Cancelled { error, param } => f
                .debug_struct("Cancelled")
                .field("error", error)
                .field("has_param", &param.is_some())
                .finish(),
            TaskEvent::ProgressInit { max } => write!(f, "ProgressInit({max})"),
            TaskEvent::Progress { progress } => write!(f, "Progress({progress})"),
        }
    }
}

/// Whether two optional cancel parameters are the same allocation
pub(crate) fn same_param(a: Option<&CancelParam>, b: Option<&CancelParam>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Listener built from a single closure over [`TaskEvent`]
pub struct EventFn<F>(F);

impl<F> EventFn<F>
where
    F: Fn(&TaskRef, TaskEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

impl<F> TaskListener for EventFn<F>
where
    F: Fn(&TaskRef, TaskEvent) + Send + Sync + 'static,
{
    fn on_started(&self, task: &TaskRef) {
        (self.0)(task, TaskEvent::Started)
    }

    fn on_post_run(&self, task: &TaskRef, result: Option<&TaskOutput>, error: Option<&TaskError>) {
        (self.0)(
            task,
            TaskEvent::PostRun {
                result: result.cloned(),
                error: error.cloned(),
            },
        )
    }

    fn on_cancel(&self, task: &TaskRef, started: bool, param: Option<&CancelParam>) {
        (self.0)(
            task,
            TaskEvent::Cancel {
                started,
                param: param.cloned(),
            },
        )
    }

    fn on_cancelled(&self, task: &TaskRef, error: Option<&TaskError>, param: Option<&CancelParam>) {
        (self.0)(
            task,
            TaskEvent::Cancelled {
                error: error.cloned(),
                param: param.cloned(),
            },
        )
    }

    fn on_progress_init(&self, task: &TaskRef, max: i64) {
        (self.0)(task, TaskEvent::ProgressInit { max })
    }

    fn on_progress(&self, task: &TaskRef, progress: i64) {
        (self.0)(task, TaskEvent::Progress { progress })
    }
}

/// Event forwarded by a [`ChannelListener`]
#[derive(Debug, Clone)]
pub struct TaskEventRecord {
    pub task: TaskRef,
    pub event: TaskEvent,
}

/// Listener forwarding every event into a tokio channel, for async consumers
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<TaskEventRecord>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskEventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, task: &TaskRef, event: TaskEvent) {
        // Receiver may be gone.
        let _ = self.tx.send(TaskEventRecord {
            task: task.clone(),
            event,
        });
    }
}

impl TaskListener for ChannelListener {
    fn on_started(&self, task: &TaskRef) {
        self.forward(task, TaskEvent::Started);
    }

    fn on_post_run(&self, task: &TaskRef, result: Option<&TaskOutput>, error: Option<&TaskError>) {
        self.forward(
            task,
            TaskEvent::PostRun {
                result: result.cloned(),
                error: error.cloned(),
            },
        );
    }

    fn on_cancel(&self, task: &TaskRef, started: bool, param: Option<&CancelParam>) {
        self.forward(
            task,
            TaskEvent::Cancel {
                started,
                param: param.cloned(),
            },
        );
    }

    fn on_cancelled(&self, task: &TaskRef, error: Option<&TaskError>, param: Option<&CancelParam>) {
        self.forward(
            task,
            TaskEvent::Cancelled {
                error: error.cloned(),
                param: param.cloned(),
            },
        );
    }

    fn on_progress_init(&self, task: &TaskRef, max: i64) {
        self.forward(task, TaskEvent::ProgressInit { max });
    }

    fn on_progress(&self, task: &TaskRef, progress: i64) {
        self.forward(task, TaskEvent::Progress { progress });
    }
}

/// Ordered set of `(listener, owner)` pairs keyed by listener identity.
///
/// Shared by tasks and the task manager's queue listeners.
pub(crate) struct ListenerRegistry<L: ?Sized> {
    entries: Mutex<Vec<(Arc<L>, Owner)>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Returns `false` if the listener is already registered
    pub(crate) fn add(&self, owner: Owner, listener: Arc<L>) -> bool {
        self.add_then(owner, listener, |_, _| {})
    }

    /// Like [`add`](Self::add), running `then` on the new entry before the
    /// registry is unlocked. Jobs `then` posts precede any later fan-out.
    pub(crate) fn add_then<F>(&self, owner: Owner, listener: Arc<L>, then: F) -> bool
    where
        F: FnOnce(&Owner, &Arc<L>),
    {
        let mut entries = lock(&self.entries);
        if entries.iter().any(|(l, _)| std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(&listener))) {
            return false;
        }
        then(&owner, &listener);
        entries.push((listener, owner));
        true
    }

    /// Returns `false` if the listener was not registered
    pub(crate) fn remove(&self, listener: &Arc<L>) -> bool {
        let mut entries = lock(&self.entries);
        match entries
            .iter()
            .position(|(l, _)| std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)))
        {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Post one job per listener, in registration order, to each listener's
    /// owner. The registry stays locked for the whole fan-out.
    pub(crate) fn post_each<F>(&self, mut make_job: F)
    where
        F: FnMut(Arc<L>) -> crate::context::Job,
    {
        let entries = lock(&self.entries);
        for (listener, owner) in entries.iter() {
            post_or_bug(owner.as_ref(), make_job(listener.clone()));
        }
    }
}
