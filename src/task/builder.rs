use crate::context::Owner;
use crate::env;
use crate::error::{Error, Result};
use crate::group::GroupCore;
use crate::task::hooks::{NoHooks, TaskHooks};
use crate::task::state::{Task, TaskParts, TaskRef};
use crate::task::types::*;
use crate::task::work::{FnWork, Work, WorkContext};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`Task`]
pub struct TaskBuilder {
    name: String,
    owner: Option<Owner>,
    priority: Priority,
    interrupt_on_cancel: bool,
    progress_interval: Duration,
    hooks: Option<Box<dyn TaskHooks>>,
    work: Option<Box<dyn Work>>,
    group: Option<Arc<GroupCore>>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if name.is_empty() {
            name = env::task::DEFAULT_TASK_NAME.to_string();
        }
        Self {
            name,
            owner: None,
            priority: Priority::NORM,
            interrupt_on_cancel: true,
            progress_interval: Duration::from_millis(env::task::PROGRESS_MIN_INTERVAL_MS),
            hooks: None,
            work: None,
            group: None,
        }
    }

    /// Context on which hooks and default listeners run
    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Default `interrupt` flag of [`Task::cancel_default`]
    pub fn interrupt_on_cancel(mut self, interrupt: bool) -> Self {
        self.interrupt_on_cancel = interrupt;
        self
    }

    /// Minimum spacing of two equal progress reports
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn hooks(mut self, hooks: impl TaskHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    /// Closure body; its `Ok` value becomes the task result
    pub fn work<F, T, E>(mut self, f: F) -> Self
    where
        F: FnOnce(&WorkContext) -> std::result::Result<T, E> + Send + 'static,
        T: Any + Send + Sync,
        E: Into<TaskError>,
    {
        self.work = Some(Box::new(FnWork(f)));
        self
    }

    /// Body implemented as a [`Work`] type
    pub fn work_impl(mut self, work: impl Work) -> Self {
        self.work = Some(Box::new(work));
        self
    }

    pub(crate) fn group_core(mut self, core: Arc<GroupCore>) -> Self {
        self.group = Some(core);
        self
    }

    pub fn build(self) -> Result<TaskRef> {
        let owner = self.owner.ok_or_else(|| Error::MissingOwner(self.name.clone()))?;
        let work = self.work.ok_or_else(|| Error::MissingWork(self.name.clone()))?;
        Ok(Task::from_parts(TaskParts {
            name: self.name,
            priority: self.priority,
            owner,
            interrupt_on_cancel: self.interrupt_on_cancel,
            progress_interval: self.progress_interval,
            hooks: self.hooks.unwrap_or_else(|| Box::new(NoHooks)),
            work,
            group: self.group,
        }))
    }
}
