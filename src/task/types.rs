use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide unique, monotonically increasing task identifier
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Value produced by a successful work body
pub type TaskOutput = Arc<dyn Any + Send + Sync>;

/// Opaque value attached to a cancel request
pub type CancelParam = Arc<dyn Any + Send + Sync>;

/// Value stored in a task or manager tag map
pub type TagValue = Arc<dyn Any + Send + Sync>;

/// Wrap a value as a [`TaskOutput`]
pub fn output<T: Any + Send + Sync>(value: T) -> TaskOutput {
    Arc::new(value)
}

/// Lifecycle state of a task.
///
/// ```text
/// --> [ Ready ] ----------------------+(cancel)
///         |                           |<on_cancel>
///         v                           |
///     [ Started ]                     |
///         | <on_started>              |
///       +-+-+                         |
///       |   |(cancel)                 |
///       |   +--> [ Cancelling ]       |
///       v              | <on_cancel>  v
///    [ Done ]          +----->[ Cancelled ]
///       | <on_post_run>               | <on_cancelled>
///       v                             v
/// [ Terminated ]         [ TerminatedCancelled ]
/// ```
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Not started yet
    Ready,
    /// Background body launched
    Started,
    /// Cancel requested, background body may still be running
    Cancelling,
    /// Background body finished after a cancel; `on_cancelled` pending
    Cancelled,
    /// Background body finished normally; `on_post_run` pending
    Done,
    /// `on_post_run` delivered
    Terminated,
    /// `on_cancelled` delivered
    TerminatedCancelled,
}

impl TaskState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            TaskState::Done
                | TaskState::Cancelled
                | TaskState::Terminated
                | TaskState::TerminatedCancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Started | TaskState::Cancelling)
    }

    pub fn is_cancel(self) -> bool {
        matches!(
            self,
            TaskState::Cancelling | TaskState::Cancelled | TaskState::TerminatedCancelled
        )
    }

    pub fn is_terminated(self) -> bool {
        matches!(self, TaskState::Terminated | TaskState::TerminatedCancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Task priority in `1..=10`, higher is more urgent
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MID_LOW: Priority = Priority(3);
    pub const NORM: Priority = Priority(5);
    pub const MID_HIGH: Priority = Priority(7);
    pub const MAX: Priority = Priority(10);

    /// Number of distinct priority levels
    pub const LEVELS: usize = 10;

    pub fn new(value: u8) -> Result<Self, Error> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidPriority(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORM
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure of a task, delivered through `on_post_run` / `on_cancelled`
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// Body observed an interrupt request and gave up
    #[error("task was interrupted")]
    Interrupted,

    /// Body reported a failure
    #[error("task failed: {message}")]
    Failed { message: String },

    /// Body panicked
    #[error("task panicked: {message}")]
    Panicked { message: String },

    /// The background thread could not be created
    #[error("failed to spawn task thread: {message}")]
    Spawn { message: String },

    /// Synchronous start requested on a task that is not ready
    #[error("task is not ready (state: {0})")]
    BadState(TaskState),

    /// Any other error raised by the body
    #[error("{0:#}")]
    Other(Arc<anyhow::Error>),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed {
            message: message.into(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, TaskError::Interrupted)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TaskError>() {
            Ok(task_err) => task_err,
            Err(err) => TaskError::Other(Arc::new(err)),
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::Other(Arc::new(err.into()))
    }
}
