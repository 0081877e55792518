//! # Task manager
//!
//! Schedules tasks under a concurrency budget. Added tasks wait in a
//! priority-bucketed ready queue and are promoted to the run set while it has
//! fewer than `max_jobs` entries. Finished tasks may be kept in a bounded
//! "watched" cache so callers can look them up by key after completion.
//!
//! Every queue mutation is reported to [`QueueListener`]s in mutation order.
//!
//! ```rust,no_run
//! use taskcore::context::Dispatcher;
//! use taskcore::manager::TaskManager;
//! use taskcore::task::{Task, TaskError};
//!
//! let owner = Dispatcher::spawn("scheduler").unwrap();
//! let manager = TaskManager::builder()
//!     .owner(owner.clone())
//!     .max_jobs(Some(2))
//!     .max_watched(10)
//!     .watch_filter(|_manager, _task, _result, error| error.is_none())
//!     .build()
//!     .unwrap();
//!
//! for i in 0..5 {
//!     let task = Task::builder(format!("job-{i}"))
//!         .owner(owner.clone())
//!         .work(move |_ctx| Ok::<_, TaskError>(i))
//!         .build()
//!         .unwrap();
//!     manager.add_task(&task);
//! }
//! ```

mod ready_queue;
mod watched;


use crate::context::Owner;
use crate::env;
use crate::error::{Error, Result, bug};
use crate::task::listener::ListenerRegistry;
use crate::task::{
    CancelParam, ListenerRef, TagValue, Task, TaskError, TaskId, TaskListener, TaskOutput, TaskRef,
};
use crate::util::lock;
use dashmap::DashMap;
use ready_queue::ReadyQueue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};
use watched::WatchedSet;

/// Configuration for task manager
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Maximum number of concurrently running tasks; absent means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_jobs: Option<usize>,
    /// Number of finished tasks kept for inspection; 0 disables the cache
    pub max_watched: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_jobs: Some(env::manager::DEFAULT_MAX_JOBS),
            max_watched: env::manager::DEFAULT_MAX_WATCHED,
        }
    }
}

impl TaskManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_jobs == Some(0) {
            return Err(Error::Config(
                "manager.max_jobs must be at least 1 (omit it for no limit)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identity under which a task is registered in a manager
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKey {
    /// The task itself
    Task(TaskId),
    /// Caller-chosen name, e.g. a download URL
    Name(String),
}

impl TaskKey {
    pub fn of(task: &TaskRef) -> Self {
        TaskKey::Task(task.id())
    }
}

impl From<&str> for TaskKey {
    fn from(name: &str) -> Self {
        TaskKey::Name(name.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(name: String) -> Self {
        TaskKey::Name(name)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Task(id) => write!(f, "#{id}"),
            TaskKey::Name(name) => f.write_str(name),
        }
    }
}

/// Manager binding of a task
pub struct TaskInfo {
    key: TaskKey,
    task_type: String,
    tag: Option<TagValue>,
    task: Weak<Task>,
    manager: Weak<Shared>,
}

impl TaskInfo {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn tag(&self) -> Option<&TagValue> {
        self.tag.as_ref()
    }

    pub fn task(&self) -> Option<TaskRef> {
        self.task.upgrade()
    }
}

impl fmt::Debug for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInfo")
            .field("key", &self.key)
            .field("task_type", &self.task_type)
            .field("has_tag", &self.tag.is_some())
            .finish()
    }
}

/// Queue mutation reported to [`QueueListener`]s
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEvent {
    AddedToReady,
    /// Left the ready queue without running
    RemovedFromReady,
    MovedToRun,
    RemovedFromRun,
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Queue a task currently sits in
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Ready,
    Run,
}

/// Observer of queue mutations.
///
/// `ready` and `run` are the queue sizes right after the mutation.
pub trait QueueListener: Send + Sync {
    fn on_event(&self, manager: &TaskManager, event: QueueEvent, ready: usize, run: usize, task: &TaskRef);
}

/// [`QueueListener`] built from a closure
pub struct QueueEventFn<F>(F);

impl<F> QueueEventFn<F>
where
    F: Fn(&TaskManager, QueueEvent, usize, usize, &TaskRef) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

impl<F> QueueListener for QueueEventFn<F>
where
    F: Fn(&TaskManager, QueueEvent, usize, usize, &TaskRef) + Send + Sync + 'static,
{
    fn on_event(&self, manager: &TaskManager, event: QueueEvent, ready: usize, run: usize, task: &TaskRef) {
        (self.0)(manager, event, ready, run, task)
    }
}

/// Decides whether a finished task is kept in the watched cache
pub trait WatchFilter: Send + Sync {
    fn watch(
        &self,
        manager: &TaskManager,
        task: &TaskRef,
        result: Option<&TaskOutput>,
        error: Option<&TaskError>,
    ) -> bool;
}

struct FilterFn<F>(F);

impl<F> WatchFilter for FilterFn<F>
where
    F: Fn(&TaskManager, &TaskRef, Option<&TaskOutput>, Option<&TaskError>) -> bool + Send + Sync,
{
    fn watch(
        &self,
        manager: &TaskManager,
        task: &TaskRef,
        result: Option<&TaskOutput>,
        error: Option<&TaskError>,
    ) -> bool {
        (self.0)(manager, task, result, error)
    }
}

struct QueueState {
    ready: ReadyQueue,
    run: Vec<TaskRef>,
}

struct Registry {
    tasks: HashMap<TaskKey, TaskRef>,
    watched: WatchedSet,
}

struct Shared {
    owner: Owner,
    max_jobs: Option<usize>,
    max_watched: usize,
    filter: Option<Box<dyn WatchFilter>>,
    queue: Mutex<QueueState>,
    registry: Mutex<Registry>,
    queue_listeners: ListenerRegistry<dyn QueueListener>,
    tags: DashMap<String, TagValue>,
    completion_listener: ListenerRef,
}

/// Hears about every task the manager tracks, on the manager owner
struct CompletionListener {
    manager: Weak<Shared>,
}

impl CompletionListener {
    fn manager(&self) -> Option<TaskManager> {
        self.manager.upgrade().map(|shared| TaskManager { shared })
    }
}

impl TaskListener for CompletionListener {
    fn on_post_run(&self, task: &TaskRef, result: Option<&TaskOutput>, error: Option<&TaskError>) {
        if let Some(manager) = self.manager() {
            manager.task_finished(task, result, error);
        }
    }

    fn on_cancelled(&self, task: &TaskRef, error: Option<&TaskError>, _param: Option<&CancelParam>) {
        if let Some(manager) = self.manager() {
            manager.task_finished(task, None, error);
        }
    }
}

/// Non-owning handle, held by task groups launching through a manager
#[derive(Clone)]
pub(crate) struct WeakTaskManager(Weak<Shared>);

impl WeakTaskManager {
    pub(crate) fn upgrade(&self) -> Option<TaskManager> {
        self.0.upgrade().map(|shared| TaskManager { shared })
    }
}

/// Builder for [`TaskManager`]
pub struct TaskManagerBuilder {
    owner: Option<Owner>,
    max_jobs: Option<usize>,
    max_watched: usize,
    filter: Option<Box<dyn WatchFilter>>,
}

impl TaskManagerBuilder {
    pub fn new() -> Self {
        let config = TaskManagerConfig::default();
        Self {
            owner: None,
            max_jobs: config.max_jobs,
            max_watched: config.max_watched,
            filter: None,
        }
    }

    /// Context on which completions are processed and queue listeners run
    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// `None` runs every added task at once
    pub fn max_jobs(mut self, max_jobs: Option<usize>) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn max_watched(mut self, max_watched: usize) -> Self {
        self.max_watched = max_watched;
        self
    }

    pub fn config(mut self, config: &TaskManagerConfig) -> Self {
        self.max_jobs = config.max_jobs;
        self.max_watched = config.max_watched;
        self
    }

    pub fn watch_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&TaskManager, &TaskRef, Option<&TaskOutput>, Option<&TaskError>) -> bool
            + Send
            + Sync
            + 'static,
    {
        self.filter = Some(Box::new(FilterFn(filter)));
        self
    }

    pub fn watch_filter_impl(mut self, filter: impl WatchFilter + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn build(self) -> Result<TaskManager> {
        let owner = self
            .owner
            .ok_or_else(|| Error::MissingOwner("TaskManager".to_string()))?;
        TaskManagerConfig {
            max_jobs: self.max_jobs,
            max_watched: self.max_watched,
        }
        .validate()?;

        let shared = Arc::new_cyclic(|weak| Shared {
            owner,
            max_jobs: self.max_jobs,
            max_watched: self.max_watched,
            filter: self.filter,
            queue: Mutex::new(QueueState {
                ready: ReadyQueue::new(),
                run: Vec::new(),
            }),
            registry: Mutex::new(Registry {
                tasks: HashMap::new(),
                watched: WatchedSet::new(self.max_watched),
            }),
            queue_listeners: ListenerRegistry::new(),
            tags: DashMap::new(),
            completion_listener: Arc::new(CompletionListener {
                manager: weak.clone(),
            }),
        });
        debug!(max_jobs = ?shared.max_jobs, max_watched = shared.max_watched, "Task manager created");
        Ok(TaskManager { shared })
    }
}

impl Default for TaskManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority scheduler with bounded concurrency and a watched-task cache
#[derive(Clone)]
pub struct TaskManager {
    shared: Arc<Shared>,
}

impl TaskManager {
    pub fn builder() -> TaskManagerBuilder {
        TaskManagerBuilder::new()
    }

    pub(crate) fn downgrade(&self) -> WeakTaskManager {
        WeakTaskManager(Arc::downgrade(&self.shared))
    }

    pub fn owner(&self) -> &Owner {
        &self.shared.owner
    }

    pub fn max_jobs(&self) -> Option<usize> {
        self.shared.max_jobs
    }

    pub fn max_watched(&self) -> usize {
        self.shared.max_watched
    }

    fn owns(&self, info: &TaskInfo) -> bool {
        std::ptr::eq(info.manager.as_ptr(), Arc::as_ptr(&self.shared))
    }

    // -- tags -------------------------------------------------------------

    pub fn set_tag(&self, key: impl Into<String>, value: TagValue) -> Option<TagValue> {
        self.shared.tags.insert(key.into(), value)
    }

    pub fn tag(&self, key: &str) -> Option<TagValue> {
        self.shared.tags.get(key).map(|v| v.value().clone())
    }

    pub fn remove_tag(&self, key: &str) -> Option<TagValue> {
        self.shared.tags.remove(key).map(|(_, v)| v)
    }

    // -- queue listeners --------------------------------------------------

    pub fn add_queue_listener(&self, owner: Owner, listener: Arc<dyn QueueListener>) -> bool {
        let added = self.shared.queue_listeners.add(owner, listener);
        if !added {
            warn!("Queue listener already registered");
        }
        added
    }

    /// Register `listener` on the manager's own owner context
    pub fn add_queue_listener_default(&self, listener: Arc<dyn QueueListener>) -> bool {
        self.add_queue_listener(self.shared.owner.clone(), listener)
    }

    pub fn remove_queue_listener(&self, listener: &Arc<dyn QueueListener>) -> bool {
        let removed = self.shared.queue_listeners.remove(listener);
        if !removed {
            warn!("Removing unknown queue listener");
        }
        removed
    }

    /// Post `event` to every queue listener. Called with the queue locked so
    /// that notifications follow mutation order.
    fn notify_locked(&self, queue: &QueueState, event: QueueEvent, task: &TaskRef) {
        let ready = queue.ready.len();
        let run = queue.run.len();
        debug!(task = %task.unique_name(), event = %event, ready, run, "Queue event");
        self.shared.queue_listeners.post_each(|listener| {
            let manager = self.clone();
            let task = task.clone();
            Box::new(move || listener.on_event(&manager, event, ready, run, &task))
        });
    }

    // -- adding -----------------------------------------------------------

    /// Add `task` keyed by itself, with no type or tag
    pub fn add_task(&self, task: &TaskRef) -> bool {
        self.add_task_with(task, TaskKey::of(task), env::manager::UNSPECIFIED_TASK_TYPE, None)
    }

    /// Add `task` under `key`.
    ///
    /// Fails if the task is not ready, already belongs to a manager, or
    /// another unfinished task holds `key`. A rejected call changes nothing.
    /// A finished task holding `key` is replaced and dropped from the watched
    /// cache. Groups are started at once instead of being queued.
    pub fn add_task_with(
        &self,
        task: &TaskRef,
        key: TaskKey,
        task_type: impl Into<String>,
        tag: Option<TagValue>,
    ) -> bool {
        if !task.is_ready() {
            warn!(task = %task.unique_name(), state = %task.state(), "Only ready tasks can be added");
            return false;
        }
        if let Some(info) = task.manager_info() {
            warn!(task = %task.unique_name(), key = %info.key, "Task is already managed");
            return false;
        }
        if self.contains(task).is_some() {
            warn!(task = %task.unique_name(), "Task is already queued");
            return false;
        }

        {
            let mut registry = lock(&self.shared.registry);
            if let Some(old) = registry.tasks.get(&key) {
                if !old.is_done() {
                    warn!(task = %task.unique_name(), key = %key, "Unfinished task already holds key");
                    return false;
                }
                let old_id = old.id();
                registry.watched.remove(old_id);
            }
            registry.tasks.insert(key.clone(), task.clone());
        }
        debug!(task = %task.unique_name(), key = %key, "Adding task");

        task.set_manager_info(Some(Arc::new(TaskInfo {
            key: key.clone(),
            task_type: task_type.into(),
            tag,
            task: Arc::downgrade(task),
            manager: Arc::downgrade(&self.shared),
        })));
        task.add_listener(self.shared.owner.clone(), self.shared.completion_listener.clone());

        let added = if task.is_group() {
            task.start()
        } else {
            self.enqueue(task)
        };
        if !added {
            warn!(task = %task.unique_name(), key = %key, "Adding task failed");
            task.remove_listener(&self.shared.completion_listener);
            task.set_manager_info(None);
            let mut registry = lock(&self.shared.registry);
            if registry.tasks.get(&key).is_some_and(|t| Arc::ptr_eq(t, task)) {
                registry.tasks.remove(&key);
            }
        }
        added
    }

    fn enqueue(&self, task: &TaskRef) -> bool {
        {
            let mut queue = lock(&self.shared.queue);
            if !queue.ready.enqueue(task.clone()) {
                warn!(task = %task.unique_name(), "Task already queued");
                return false;
            }
            self.notify_locked(&queue, QueueEvent::AddedToReady, task);
        }
        self.balance();
        true
    }

    fn has_free_slot(&self, queue: &QueueState) -> bool {
        self.shared.max_jobs.is_none_or(|max| queue.run.len() < max)
    }

    /// Promote ready tasks while run slots are free
    fn balance(&self) {
        loop {
            let task = {
                let mut queue = lock(&self.shared.queue);
                if !self.has_free_slot(&queue) {
                    return;
                }
                let Some(task) = queue.ready.dequeue() else {
                    return;
                };
                queue.run.push(task.clone());
                self.notify_locked(&queue, QueueEvent::MovedToRun, &task);
                task
            };

            if !task.start() {
                // Cancelled behind the manager's back; its completion cleans up.
                if !task.is_cancel() {
                    bug!("{} promoted to run but could not start", task.unique_name());
                }
                debug!(task = %task.unique_name(), "Promoted task was already cancelled");
            }
        }
    }

    /// Runs on the manager owner once `task` delivered its terminal event
    fn task_finished(&self, task: &TaskRef, result: Option<&TaskOutput>, error: Option<&TaskError>) {
        task.remove_listener(&self.shared.completion_listener);
        {
            let mut queue = lock(&self.shared.queue);
            if let Some(index) = queue.run.iter().position(|t| Arc::ptr_eq(t, task)) {
                queue.run.remove(index);
                self.notify_locked(&queue, QueueEvent::RemovedFromRun, task);
            } else if queue.ready.remove(task) {
                self.notify_locked(&queue, QueueEvent::RemovedFromReady, task);
            }
        }
        self.balance();
        self.retain(task, result, error);
    }

    /// Keep `task` in the watched cache or forget it
    fn retain(&self, task: &TaskRef, result: Option<&TaskOutput>, error: Option<&TaskError>) {
        let Some(info) = task.manager_info().filter(|info| self.owns(info)) else {
            return;
        };
        let watch = self.shared.max_watched > 0
            && self
                .shared
                .filter
                .as_ref()
                .is_some_and(|filter| filter.watch(self, task, result, error));

        let mut registry = lock(&self.shared.registry);
        if !registry.tasks.get(&info.key).is_some_and(|t| Arc::ptr_eq(t, task)) {
            debug!(task = %task.unique_name(), key = %info.key, "Key was re-bound, not retaining");
            return;
        }

        if !watch {
            registry.tasks.remove(&info.key);
            return;
        }

        if registry.watched.contains(task.id()) {
            bug!("{} finished twice", task.unique_name());
        }
        let evicted = registry.watched.insert(task.clone());
        for old in &evicted {
            if let Some(old_info) = old.manager_info() {
                if registry.tasks.get(&old_info.key).is_some_and(|t| Arc::ptr_eq(t, old)) {
                    registry.tasks.remove(&old_info.key);
                }
            }
        }
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), watched = registry.watched.len(), "Shrunk watched tasks");
        }
    }

    // -- cancelling -------------------------------------------------------

    /// Cancel a task of this manager.
    ///
    /// A queued task leaves the ready queue and is cancelled synchronously;
    /// running tasks and groups are cancelled as by [`Task::cancel`].
    pub fn cancel_task(&self, task: &TaskRef, param: Option<CancelParam>, interrupt: bool) -> bool {
        if task.is_group() {
            if !task.manager_info().is_some_and(|info| self.owns(&info)) {
                warn!(task = %task.unique_name(), "Cancelling group of another manager");
                return false;
            }
            return task.cancel(param, interrupt);
        }

        {
            let mut queue = lock(&self.shared.queue);
            let in_run = queue.run.iter().any(|t| Arc::ptr_eq(t, task));
            if queue.ready.remove(task) {
                self.notify_locked(&queue, QueueEvent::RemovedFromReady, task);
            } else if !in_run {
                warn!(task = %task.unique_name(), "Cancelling task unknown to the manager");
                return false;
            }
        }
        debug!(task = %task.unique_name(), "Cancelling task");
        task.cancel(param, interrupt)
    }

    /// [`cancel_task`](Self::cancel_task) with the task's own interrupt default
    pub fn cancel_task_default(&self, task: &TaskRef) -> bool {
        self.cancel_task(task, None, task.interrupt_on_cancel())
    }

    // -- lookup -----------------------------------------------------------

    pub fn get_task(&self, key: &TaskKey) -> Option<TaskRef> {
        lock(&self.shared.registry).tasks.get(key).cloned()
    }

    /// Binding of `task`, if it was added to this manager
    pub fn task_info(&self, task: &TaskRef) -> Option<Arc<TaskInfo>> {
        task.manager_info().filter(|info| self.owns(info))
    }

    /// Tracked tasks whose type is `task_type`, oldest first
    pub fn tasks_of_type(&self, task_type: &str) -> Vec<TaskRef> {
        let mut tasks: Vec<TaskRef> = lock(&self.shared.registry)
            .tasks
            .values()
            .filter(|task| {
                task.manager_info()
                    .is_some_and(|info| info.task_type == task_type)
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.id());
        tasks
    }

    /// Forget a finished task kept in the watched cache
    pub fn remove_watched_task(&self, task: &TaskRef) -> bool {
        if !task.is_done() {
            warn!(task = %task.unique_name(), "Only finished tasks can be removed");
            return false;
        }
        let Some(info) = self.task_info(task) else {
            return false;
        };
        let mut registry = lock(&self.shared.registry);
        if !registry.tasks.get(&info.key).is_some_and(|t| Arc::ptr_eq(t, task)) {
            warn!(task = %task.unique_name(), "Removing unknown watched task");
            return false;
        }
        registry.tasks.remove(&info.key);
        registry.watched.remove(task.id());
        true
    }

    /// Watched tasks, oldest first
    pub fn watched_tasks(&self) -> Vec<TaskRef> {
        lock(&self.shared.registry).watched.tasks()
    }

    /// Number of keys currently tracked, running and watched tasks included
    pub fn tracked_len(&self) -> usize {
        lock(&self.shared.registry).tasks.len()
    }

    pub fn contains(&self, task: &TaskRef) -> Option<QueueKind> {
        let queue = lock(&self.shared.queue);
        if queue.ready.contains(task.id()) {
            Some(QueueKind::Ready)
        } else if queue.run.iter().any(|t| Arc::ptr_eq(t, task)) {
            Some(QueueKind::Run)
        } else {
            None
        }
    }

    /// Tasks waiting or running
    pub fn len(&self) -> usize {
        let queue = lock(&self.shared.queue);
        queue.ready.len() + queue.run.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ready_len(&self) -> usize {
        lock(&self.shared.queue).ready.len()
    }

    pub fn run_len(&self) -> usize {
        lock(&self.shared.queue).run.len()
    }

    /// Ready tasks in promotion order
    pub fn ready_tasks(&self) -> Vec<TaskRef> {
        lock(&self.shared.queue).ready.iter().cloned().collect()
    }

    /// `"{unique_name}<{key}>"`
    pub fn debug_name(&self, task: &TaskRef) -> String {
        match self.task_info(task) {
            Some(info) => format!("{}<{}>", task.unique_name(), info.key),
            None => task.unique_name().to_string(),
        }
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("max_jobs", &self.shared.max_jobs)
            .field("max_watched", &self.shared.max_watched)
            .field("ready", &self.ready_len())
            .field("run", &self.run_len())
            .finish()
    }
}
