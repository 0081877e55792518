//! Task groups: a task whose body starts a set of children and waits until
//! every started child has finished.
//!
//! The group reports its own progress as the number of finished children.
//! With `stop_on_exception` the first child failing in its body becomes the
//! group's result task and the whole group is cancelled.

use crate::context::{Owner, post_or_bug};
use crate::env;
use crate::error::Result;
use crate::manager::{TaskManager, WeakTaskManager};
use crate::task::{
    CancelParam, ListenerRef, Priority, Task, TaskBuilder, TaskError, TaskHooks, TaskListener,
    TaskOutput, TaskRef, Work, WorkContext, output,
};
use crate::util::lock;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};


/// Runs on the group thread before any child starts; returned tasks are
/// appended to the children.
pub type PrepareFn = Box<dyn FnOnce(&TaskGroup) -> Vec<TaskRef> + Send + 'static>;

/// Runs on the group thread once every child finished. Receives the result
/// task and `TaskError::Interrupted` if the group was cancelled at any point.
/// An error fails the group; without a finalizer the interruption is the
/// group's error.
pub type FinalizeFn = Box<
    dyn FnOnce(&TaskGroup, Option<TaskRef>, Option<TaskError>) -> std::result::Result<(), TaskError>
        + Send
        + 'static,
>;

/// How children are started and cancelled
enum Launcher {
    Direct,
    Manager(WeakTaskManager),
}

#[derive(Default)]
struct Completion {
    started: Option<usize>,
    /// Children that could not be started, counted as finished in progress
    skipped: usize,
    done: usize,
    result_task: Option<TaskRef>,
    latch: Option<oneshot::Sender<()>>,
}

/// Group behavior composed into a [`Task`]
pub(crate) struct GroupCore {
    task: OnceLock<Weak<Task>>,
    children: Mutex<Vec<TaskRef>>,
    stop_on_exception: bool,
    launcher: Launcher,
    prepare: Mutex<Option<PrepareFn>>,
    finalize: Mutex<Option<FinalizeFn>>,
    completion: Mutex<Completion>,
    child_listener: ListenerRef,
}

impl GroupCore {
    fn new(
        children: Vec<TaskRef>,
        stop_on_exception: bool,
        launcher: Launcher,
        prepare: Option<PrepareFn>,
        finalize: Option<FinalizeFn>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|core| GroupCore {
            task: OnceLock::new(),
            children: Mutex::new(children),
            stop_on_exception,
            launcher,
            prepare: Mutex::new(prepare),
            finalize: Mutex::new(finalize),
            completion: Mutex::new(Completion::default()),
            child_listener: Arc::new(ChildListener { core: core.clone() }),
        })
    }

    fn task(&self) -> Option<TaskRef> {
        self.task.get().and_then(Weak::upgrade)
    }

    fn launch(&self, child: &TaskRef) -> bool {
        match &self.launcher {
            Launcher::Direct => child.start(),
            Launcher::Manager(manager) => match manager.upgrade() {
                Some(manager) => manager.add_task(child),
                None => {
                    warn!(task = %child.unique_name(), "Task manager of the group is gone");
                    false
                }
            },
        }
    }

    fn cancel_child(&self, child: &TaskRef, param: Option<CancelParam>) -> bool {
        match &self.launcher {
            Launcher::Manager(manager) => match manager.upgrade() {
                Some(manager) => manager.cancel_task(child, param, child.interrupt_on_cancel()),
                None => child.cancel(param, true),
            },
            Launcher::Direct => child.cancel(param, true),
        }
    }

    fn release(&self) {
        if let Some(latch) = lock(&self.completion).latch.take() {
            let _ = latch.send(());
        }
    }

    /// Posted to the group owner by the group body
    fn start_children(&self, group: &TaskRef) {
        if group.is_cancel() {
            debug!(task = %group.unique_name(), "Group cancelled before its children started");
            lock(&self.completion).started = Some(0);
            self.release();
            return;
        }

        let children = lock(&self.children).clone();
        let mut started = 0;
        for child in &children {
            child.add_listener(group.owner().clone(), self.child_listener.clone());
            if self.launch(child) {
                started += 1;
            } else {
                warn!(
                    task = %group.unique_name(),
                    child = %child.unique_name(),
                    "Child could not be started"
                );
                child.remove_listener(&self.child_listener);
            }
        }
        debug!(task = %group.unique_name(), started, total = children.len(), "Children started");

        let skipped = children.len() - started;
        let (all_done, finished) = {
            let mut completion = lock(&self.completion);
            completion.started = Some(started);
            completion.skipped = skipped;
            (completion.done >= started, completion.done + skipped)
        };
        if skipped > 0 {
            group.publish_progress(finished as i64);
        }
        if all_done {
            self.release();
        }
    }

    fn child_done(&self, child: &TaskRef, error: Option<&TaskError>, ran_to_end: bool) {
        let Some(group) = self.task() else {
            return;
        };

        if ran_to_end && self.stop_on_exception && error.is_some() {
            let first = {
                let mut completion = lock(&self.completion);
                if completion.result_task.is_none() {
                    completion.result_task = Some(child.clone());
                    true
                } else {
                    false
                }
            };
            if first {
                debug!(
                    task = %group.unique_name(),
                    child = %child.unique_name(),
                    "Child failed, stopping group"
                );
                group.cancel(None, true);
            }
        }

        let (finished, all_done) = {
            let mut completion = lock(&self.completion);
            completion.done += 1;
            let all_done = completion.started.is_some_and(|started| completion.done >= started);
            (completion.done + completion.skipped, all_done)
        };
        group.publish_progress(finished as i64);
        if all_done {
            self.release();
        }
    }
}

struct ChildListener {
    core: Weak<GroupCore>,
}

impl TaskListener for ChildListener {
    fn on_post_run(&self, task: &TaskRef, _result: Option<&TaskOutput>, error: Option<&TaskError>) {
        if let Some(core) = self.core.upgrade() {
            core.child_done(task, error, true);
        }
    }

    fn on_cancelled(&self, task: &TaskRef, error: Option<&TaskError>, _param: Option<&CancelParam>) {
        if let Some(core) = self.core.upgrade() {
            core.child_done(task, error, false);
        }
    }
}

struct GroupHooks(Arc<GroupCore>);

impl TaskHooks for GroupHooks {
    fn on_early_cancel(&self, task: &TaskRef, _started: bool, param: Option<&CancelParam>) {
        let children = lock(&self.0.children).clone();
        debug!(task = %task.unique_name(), children = children.len(), "Cancelling children");
        for child in &children {
            self.0.cancel_child(child, param.cloned());
        }
    }
}

struct GroupWork(Arc<GroupCore>);

impl Work for GroupWork {
    fn run(self: Box<Self>, ctx: &WorkContext) -> std::result::Result<Option<TaskOutput>, TaskError> {
        let core = self.0;
        let group = TaskGroup {
            task: ctx.task().clone(),
            core: core.clone(),
        };

        let prepare = lock(&core.prepare).take();
        if let Some(prepare) = prepare {
            let extra = prepare(&group);
            lock(&core.children).extend(extra);
        }

        let interrupted = if group.task.is_cancel() {
            Some(TaskError::Interrupted)
        } else {
            let total = lock(&core.children).len();
            group.task.publish_progress_init(total as i64);

            let (latch_tx, latch_rx) = oneshot::channel();
            lock(&core.completion).latch = Some(latch_tx);

            let starter = core.clone();
            let task = group.task.clone();
            post_or_bug(
                group.task.owner().as_ref(),
                Box::new(move || starter.start_children(&task)),
            );

            // Released only once every started child has drained.
            let _ = latch_rx.blocking_recv();
            group.task.is_cancel().then_some(TaskError::Interrupted)
        };

        let result_task = group.result_task();
        let finalize = lock(&core.finalize).take();
        match finalize {
            Some(finalize) => finalize(&group, result_task.clone(), interrupted)?,
            None => {
                if let Some(err) = interrupted {
                    return Err(err);
                }
            }
        }
        Ok(result_task.map(output))
    }
}

/// Handle to a task group.
///
/// The group itself is an ordinary [`Task`]: start, cancel and listen to it
/// through [`task`](Self::task).
#[derive(Clone)]
pub struct TaskGroup {
    task: TaskRef,
    core: Arc<GroupCore>,
}

impl TaskGroup {
    pub fn builder(name: impl Into<String>) -> TaskGroupBuilder {
        TaskGroupBuilder::new(name)
    }

    /// Group view of `task`, if it is a group
    pub fn from_task(task: &TaskRef) -> Option<TaskGroup> {
        task.group_core().map(|core| TaskGroup {
            task: task.clone(),
            core: core.clone(),
        })
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn children(&self) -> Vec<TaskRef> {
        lock(&self.core.children).clone()
    }

    pub fn stop_on_exception(&self) -> bool {
        self.core.stop_on_exception
    }

    /// First child that failed while `stop_on_exception` was set
    pub fn result_task(&self) -> Option<TaskRef> {
        lock(&self.core.completion).result_task.clone()
    }

    /// Number of children that finished so far
    pub fn done_count(&self) -> usize {
        lock(&self.core.completion).done
    }

    pub fn start(&self) -> bool {
        self.task.start()
    }

    pub fn cancel(&self, param: Option<CancelParam>, interrupt: bool) -> bool {
        self.task.cancel(param, interrupt)
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("task", &self.task)
            .field("children", &lock(&self.core.children).len())
            .field("stop_on_exception", &self.core.stop_on_exception)
            .finish()
    }
}

/// Builder for [`TaskGroup`]
pub struct TaskGroupBuilder {
    task: TaskBuilder,
    children: Vec<TaskRef>,
    stop_on_exception: bool,
    prepare: Option<PrepareFn>,
    finalize: Option<FinalizeFn>,
    manager: Option<WeakTaskManager>,
}

impl TaskGroupBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if name.is_empty() {
            name = env::task::DEFAULT_GROUP_NAME.to_string();
        }
        Self {
            task: TaskBuilder::new(name).interrupt_on_cancel(false),
            children: Vec::new(),
            stop_on_exception: false,
            prepare: None,
            finalize: None,
            manager: None,
        }
    }

    pub fn owner(mut self, owner: Owner) -> Self {
        self.task = self.task.owner(owner);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.task = self.task.priority(priority);
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.task = self.task.progress_interval(interval);
        self
    }

    pub fn child(mut self, task: TaskRef) -> Self {
        self.children.push(task);
        self
    }

    pub fn children(mut self, tasks: impl IntoIterator<Item = TaskRef>) -> Self {
        self.children.extend(tasks);
        self
    }

    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    pub fn prepare<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&TaskGroup) -> Vec<TaskRef> + Send + 'static,
    {
        self.prepare = Some(Box::new(f));
        self
    }

    pub fn finalize<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&TaskGroup, Option<TaskRef>, Option<TaskError>) -> std::result::Result<(), TaskError>
            + Send
            + 'static,
    {
        self.finalize = Some(Box::new(f));
        self
    }

    /// Start and cancel children through `manager` instead of directly
    pub fn manager(mut self, manager: &TaskManager) -> Self {
        self.manager = Some(manager.downgrade());
        self
    }

    pub fn build(self) -> Result<TaskGroup> {
        let launcher = match self.manager {
            Some(manager) => Launcher::Manager(manager),
            None => Launcher::Direct,
        };
        let core = GroupCore::new(
            self.children,
            self.stop_on_exception,
            launcher,
            self.prepare,
            self.finalize,
        );
        let task = self
            .task
            .hooks(GroupHooks(core.clone()))
            .work_impl(GroupWork(core.clone()))
            .group_core(core.clone())
            .build()?;
        // A fresh OnceLock cannot already be set.
        let _ = core.task.set(Arc::downgrade(&task));
        Ok(TaskGroup { task, core })
    }
}
