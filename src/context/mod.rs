//! # Owner contexts
//!
//! An owner context is a single-threaded, FIFO executor. Every lifecycle
//! callback of a task or manager is *posted* to one; nothing in this crate
//! invokes listener code inline.
//!
//! The crate only needs two capabilities from a context: telling whether the
//! caller is running on it (used for assertions) and accepting a job for later
//! execution. [`Dispatcher`] is the bundled implementation backed by a
//! dedicated OS thread.
//!
//! ```rust,no_run
//! use taskcore::context::{Dispatcher, OwnerContext};
//!
//! let owner = Dispatcher::spawn("ui").unwrap();
//! owner.post(Box::new(|| println!("runs on the 'ui' thread")));
//! owner.flush_blocking();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub mod dispatcher;

#[cfg(test)]
mod tests;

pub use dispatcher::Dispatcher;

/// Unit of work posted to an owner context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to an owner context
pub type Owner = Arc<dyn OwnerContext>;

/// Identity of an owner context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single-threaded serialized executor that receives posted callbacks
pub trait OwnerContext: Send + Sync {
    /// Identity of this context
    fn id(&self) -> ContextId;

    /// Whether the calling thread is currently executing on this context
    fn is_current(&self) -> bool;

    /// Enqueue `job` to run later on this context, after every job posted
    /// before it. Returns `false` once the context no longer accepts work.
    fn post(&self, job: Job) -> bool;
}

/// Posts `job`, treating a rejected post as a broken invariant.
pub(crate) fn post_or_bug(owner: &dyn OwnerContext, job: Job) {
    if !owner.post(job) {
        crate::error::bug!("owner context {} rejected a posted job", owner.id());
    }
}
