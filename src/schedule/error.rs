use thiserror::Error;

use crate::executor::ExecutionError;
use crate::storage::StorageError;

/// Errors from the cron scheduler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScheduleError {
    /// A cron expression failed validation at construction time.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// The scheduler was built without any cron-bearing handlers.
    #[error("no handlers with a cron expression were provided")]
    NoScheduledHandlers,

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
