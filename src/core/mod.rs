//! Foundation types: records, the submission contract, the step digest
//! and the step-wrapper cache codec.

mod codec;
mod digest;
mod error;
mod event;
mod execution;

pub use codec::{decode_step_blob, encode_step_value, StepLookup};
pub use digest::step_id;
pub use error::{CoreError, Result};
pub use event::Event;
pub use execution::{CronExecution, Execution, ExecutionStatus, StepRecord};

/// Current wall-clock time in milliseconds since the epoch.
///
/// All record timestamps (`created_at`, `updated_at`, step timestamps,
/// cron bookkeeping) go through this one clock.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
