//! Explicit runtime context.
//!
//! [`TaskRuntime`] owns the default owner context and the defaults every
//! task, group and manager built through it starts from. Nothing in the crate
//! relies on global state; create one runtime per application and pass it
//! where tasks are made.

use crate::context::{Dispatcher, Owner};
use crate::env;
use crate::error::{Error, Result};
use crate::group::TaskGroupBuilder;
use crate::manager::{TaskManagerBuilder, TaskManagerConfig};
use crate::task::{Priority, TaskBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Defaults applied to tasks built through a [`TaskRuntime`]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TaskDefaults {
    pub priority: u8,
    pub interrupt_on_cancel: bool,
    pub progress_interval_ms: u64,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            priority: Priority::NORM.value(),
            interrupt_on_cancel: true,
            progress_interval_ms: env::task::PROGRESS_MIN_INTERVAL_MS,
        }
    }
}

/// Configuration of a [`TaskRuntime`]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Thread name of the default owner context
    pub dispatcher_name: String,
    /// `tracing` filter used by binaries embedding the runtime
    pub log_filter: String,
    pub task: TaskDefaults,
    pub manager: TaskManagerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dispatcher_name: env::context::DEFAULT_DISPATCHER_NAME.to_string(),
            log_filter: env::DEFAULT_LOG_FILTER.to_string(),
            task: TaskDefaults::default(),
            manager: TaskManagerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Convert configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        Priority::new(self.task.priority)?;
        if self.dispatcher_name.is_empty() {
            return Err(Error::Config("dispatcher_name must not be empty".to_string()));
        }
        self.manager.validate()
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.task.progress_interval_ms)
    }
}

/// Application-wide context handing out pre-configured builders
pub struct TaskRuntime {
    config: RuntimeConfig,
    priority: Priority,
    dispatcher: Arc<Dispatcher>,
}

impl TaskRuntime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let priority = Priority::new(config.task.priority)?;
        let dispatcher = Dispatcher::spawn(config.dispatcher_name.clone())?;
        info!(dispatcher = %config.dispatcher_name, "Task runtime started");
        Ok(Self {
            config,
            priority,
            dispatcher,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Default owner context
    pub fn owner(&self) -> Owner {
        self.dispatcher.clone()
    }

    pub fn task(&self, name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
            .owner(self.owner())
            .priority(self.priority)
            .interrupt_on_cancel(self.config.task.interrupt_on_cancel)
            .progress_interval(self.config.progress_interval())
    }

    pub fn group(&self, name: impl Into<String>) -> TaskGroupBuilder {
        TaskGroupBuilder::new(name)
            .owner(self.owner())
            .progress_interval(self.config.progress_interval())
    }

    pub fn manager(&self) -> TaskManagerBuilder {
        TaskManagerBuilder::new()
            .owner(self.owner())
            .config(&self.config.manager)
    }

    /// Wait until every callback posted so far to the default owner ran
    pub async fn flush(&self) -> bool {
        self.dispatcher.flush().await
    }

    /// Stop the default owner context after draining it
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        info!(dispatcher = %self.config.dispatcher_name, "Task runtime stopped");
    }
}
