//! Handler registration contract.
//!
//! Dispatch is name-keyed over an opaque JSON payload: the engine never
//! knows payload types, each handler decodes its own `event.data`. A
//! handler is an async closure boxed behind an `Arc` so the registry can
//! hand it to any worker task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::step::StepRunner;

/// The standard boxed error used across async Rust ecosystems; anything
/// implementing `std::error::Error` converts into it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler invocation produces: a JSON result on success, an
/// error that feeds the retry policy otherwise.
pub type HandlerResult = std::result::Result<Value, BoxError>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type HandlerFn = Arc<dyn Fn(HandlerContext) -> HandlerFuture + Send + Sync>;

/// The event as a handler sees it.
#[derive(Debug, Clone)]
pub struct HandlerEvent {
    pub name: String,
    pub data: Value,
    pub id: String,
    /// The execution's `created_at`.
    pub timestamp: i64,
}

/// Everything passed into a handler invocation: the event and the
/// memoizing step runner bound to this execution.
pub struct HandlerContext {
    pub event: HandlerEvent,
    pub step: StepRunner,
}

/// A registered handler: the async function plus its metadata.
///
/// `retries` is the number of re-attempts after the first failure, so
/// `retries = 2` allows up to three invocations in total. A handler with
/// a `cron` expression is additionally fired by the scheduler.
#[derive(Clone)]
pub struct Handler {
    id: String,
    retries: u32,
    retry_delay: Duration,
    cron: Option<String>,
    func: HandlerFn,
}

impl Handler {
    pub fn new<F, Fut>(id: impl Into<String>, func: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            id: id.into(),
            retries: 0,
            retry_delay: Duration::ZERO,
            cron: None,
            func: Arc::new(move |ctx| Box::pin(func(ctx))),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron = Some(expression.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn cron(&self) -> Option<&str> {
        self.cron.as_deref()
    }

    pub(crate) fn invoke(&self, context: HandlerContext) -> HandlerFuture {
        (self.func)(context)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("cron", &self.cron)
            .finish_non_exhaustive()
    }
}
