//! Construction and configuration errors.
//!
//! Failures of work bodies never surface here; they travel through
//! [`TaskError`](crate::task::TaskError) and the listener callbacks.

/// Errors raised while building tasks, groups, managers or the runtime
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was built without an owner context
    #[error("no owner context configured for '{0}'")]
    MissingOwner(String),

    /// A task was built without a work body
    #[error("no work body configured for '{0}'")]
    MissingWork(String),

    /// Priority outside `1..=10`
    #[error("invalid priority {0}: expected 1..=10")]
    InvalidPriority(u8),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Logs and panics on a broken internal invariant.
///
/// Never used for runtime conditions; only for states that cannot be reached
/// by a correct program.
macro_rules! bug {
    () => {
        $crate::error::bug!("internal invariant violated")
    };
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        tracing::error!(target: "taskcore::bug", "{}", msg);
        panic!("taskcore bug: {}", msg)
    }};
}

/// `bug!` unless the condition holds.
macro_rules! bug_on {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::error::bug!($($arg)+);
        }
    };
}

pub(crate) use bug;
pub(crate) use bug_on;
