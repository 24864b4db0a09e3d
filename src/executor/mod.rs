//! Execution layer: the producer client, the memoizing step runner, the
//! worker pool and the lifecycle event bus.

mod bus;
mod client;
mod error;
mod handler;
mod monitor;
mod step;
mod worker;

pub use bus::{EventBus, WorchEvent};
pub use client::Client;
pub use error::{ExecutionError, Result};
pub use handler::{BoxError, Handler, HandlerContext, HandlerEvent, HandlerResult};
pub use monitor::{ExecutionDetail, Monitor, Stats};
pub use step::StepRunner;
pub use worker::Worcher;
