//! # taskcore
//!
//! An in-process framework for running units of work on background threads
//! while delivering every lifecycle notification back on a designated
//! *owner context*.
//!
//! ## Architecture Overview
//!
//! - **[`context`]**: Owner contexts, single-threaded FIFO executors receiving callbacks
//! - **[`task`]**: The task state machine, listeners, hooks and progress reporting
//! - **[`group`]**: Composite tasks running children in parallel with fail-fast
//! - **[`manager`]**: Priority scheduling with a bounded run slot count
//! - **[`runtime`]**: Explicit runtime context and TOML configuration
//!
//! ## Features
//!
//! ### Tasks
//! - **Owner-context callbacks**: Started, post-run, cancel, cancelled and progress events
//! - **Cooperative interruption**: Bodies observe a cancellation token
//! - **Throttled progress**: Reports of unchanged value are dropped inside the interval
//!
//! ### Scheduling
//! - **Ten priority levels**: FIFO within a level, highest level first
//! - **Keyed replacement**: A finished task is replaced by a new task with the same key
//! - **Watched tasks**: Finished tasks retained for inspection with batch eviction
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskcore::{RuntimeConfig, TaskRuntime};
//!
//! fn main() -> anyhow::Result<()> {
//!     let runtime = TaskRuntime::new(RuntimeConfig::default())?;
//!     let manager = runtime.manager().build()?;
//!
//!     let task = runtime
//!         .task("checksum")
//!         .work(|_| Ok::<_, anyhow::Error>(42u64))
//!         .build()?;
//!     manager.add_task(&task);
//!
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

/// Owner contexts receiving every lifecycle callback.
pub mod context;

/// Environment constants and defaults.
pub mod env;

/// Construction and configuration errors.
pub mod error;

/// Task groups.
///
/// A group is itself a task whose body launches its children and waits for
/// all of them to finish.
pub mod group;

/// Priority task manager.
pub mod manager;

/// Runtime context and configuration.
pub mod runtime;

/// The task state machine.
pub mod task;

mod util;

pub use context::{ContextId, Dispatcher, Job, Owner, OwnerContext};
pub use error::{Error, Result};
pub use group::{TaskGroup, TaskGroupBuilder};
pub use manager::{
    QueueEvent, QueueListener, TaskInfo, TaskKey, TaskManager, TaskManagerBuilder,
    TaskManagerConfig, WatchFilter,
};
pub use runtime::{RuntimeConfig, TaskDefaults, TaskRuntime};
pub use task::{
    CancelParam, Priority, Task, TaskBuilder, TaskError, TaskEvent, TaskHooks, TaskId,
    TaskListener, TaskOutput, TaskRef, TaskState, Work, WorkContext,
};
