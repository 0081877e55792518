//! Constants and defaults shared across the crate.
//!
//! Centralizes the hardcoded values (intervals, names, limits) so that
//! configuration defaults and the runtime agree on them.

/// Configuration file name looked up by the demo binary
pub const CONFIG_FILE_NAME: &str = "taskcore.toml";

/// Default `tracing` filter directive
pub const DEFAULT_LOG_FILTER: &str = "taskcore=info";

/// Task related defaults
pub mod task {
    /// Minimum interval between two accepted progress reports of equal value
    pub const PROGRESS_MIN_INTERVAL_MS: u64 = 500;

    /// Name given to tasks built without one
    pub const DEFAULT_TASK_NAME: &str = "Task";

    /// Name given to task groups built without one
    pub const DEFAULT_GROUP_NAME: &str = "TaskGroup";
}

/// Owner context defaults
pub mod context {
    /// Thread name of the runtime's default dispatcher
    pub const DEFAULT_DISPATCHER_NAME: &str = "taskcore-owner";
}

/// Task manager defaults
pub mod manager {
    /// Task type recorded when the caller does not supply one
    pub const UNSPECIFIED_TASK_TYPE: &str = "unspecified";

    /// Default number of concurrently running tasks
    pub const DEFAULT_MAX_JOBS: usize = 3;

    /// Default number of finished tasks kept for inspection
    pub const DEFAULT_MAX_WATCHED: usize = 0;
}

/// High-water mark of the watched-task cache for a given low-water mark.
///
/// Once the cache holds this many entries it is shrunk back in one batch.
pub fn watched_high_water(max_watched: usize) -> usize {
    max_watched + max_watched / 2
}
