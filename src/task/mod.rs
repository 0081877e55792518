//! Tasks: units of work run once on a dedicated thread.
//!
//! A [`Task`] walks the states described on [`TaskState`]. Every transition
//! that matters to the outside world is reported to [`TaskListener`]s, each
//! on the owner context it registered with.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskcore::context::Dispatcher;
//! use taskcore::task::{EventFn, Task, TaskError};
//!
//! let owner = Dispatcher::spawn("ui").unwrap();
//! let task = Task::builder("sum")
//!     .owner(owner.clone())
//!     .work(|ctx| {
//!         ctx.publish_progress_init(10);
//!         let mut total = 0u64;
//!         for i in 0..10 {
//!             ctx.check_interrupted()?;
//!             total += i;
//!             ctx.publish_progress(i as i64 + 1);
//!         }
//!         Ok::<_, TaskError>(total)
//!     })
//!     .build()
//!     .unwrap();
//!
//! task.add_listener_default(EventFn::new(|task, event| {
//!     println!("{}: {:?}", task.unique_name(), event);
//! }));
//! task.start();
//! ```

pub mod builder;
pub mod hooks;
pub mod listener;
pub(crate) mod progress;
pub mod state;
pub mod types;
pub mod work;

#[cfg(test)]
mod tests;

pub use builder::TaskBuilder;
pub use hooks::TaskHooks;
pub use listener::{
    ChannelListener, EventFn, ListenerRef, TaskEvent, TaskEventKind, TaskEventRecord, TaskListener,
};
pub use state::{Task, TaskRef};
pub use types::*;
pub use work::{Work, WorkContext};
