use thiserror::Error;

use crate::core::CoreError;
use crate::storage::StorageError;

/// Errors surfaced by the client and the worker pool.
///
/// Handler failures are deliberately absent: a failing handler is an
/// expected outcome that drives the retry state machine, not an error of
/// the engine itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Operation attempted before the startup handshake completed.
    #[error("not ready: connect() must complete first")]
    NotReady,

    /// An execution record is missing required fields.
    #[error("malformed execution record {id}: {reason}")]
    MalformedRecord { id: String, reason: String },

    /// An execution payload could not be parsed.
    #[error("malformed payload for execution {id}: {reason}")]
    MalformedPayload { id: String, reason: String },

    /// No handler is registered for the event name.
    #[error("unknown handler for event {0:?}")]
    UnknownHandler(String),

    /// Two handlers were registered under the same event name.
    #[error("duplicate handler id {0:?}")]
    DuplicateHandler(String),

    /// `start()` called on a pool that is already running.
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// `stop()` called on a pool that is not running.
    #[error("worker pool is not running")]
    NotRunning,

    /// A record conversion or codec failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A store operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
