//! Middleware hooks around send / consume / confirm.
//!
//! Hooks run in registration order. A hook may:
//! - return `Ok(())` to let the chain continue,
//! - return [`HookSignal::StopChain`] to skip the remaining hooks of this phase
//!   (the operation itself still runs),
//! - return [`HookSignal::Drop`] to discard the message,
//! - return [`HookSignal::Failed`] for any other failure.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::Message;

/// Hook phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    BeforeSend,
    AfterSend,
    BeforeConsume,
    AfterConsume,
    BeforeConfirm,
    AfterConfirm,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeSend => "before_send",
            Self::AfterSend => "after_send",
            Self::BeforeConsume => "before_consume",
            Self::AfterConsume => "after_consume",
            Self::BeforeConfirm => "before_confirm",
            Self::AfterConfirm => "after_confirm",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is running the hook: a step, a broker, or a step consuming from a broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookContext {
    pub step: Option<String>,
    pub broker: Option<String>,
}

impl HookContext {
    pub fn for_step(step: impl Into<String>) -> Self {
        Self {
            step: Some(step.into()),
            broker: None,
        }
    }

    pub fn for_broker(broker: impl Into<String>) -> Self {
        Self {
            step: None,
            broker: Some(broker.into()),
        }
    }

    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = Some(broker.into());
        self
    }
}

/// Non-`Ok` outcome of a hook.
#[derive(Debug)]
pub enum HookSignal {
    StopChain(String),
    Drop(String),
    Failed(anyhow::Error),
}

impl HookSignal {
    pub fn stop(reason: impl Into<String>) -> Self {
        Self::StopChain(reason.into())
    }

    pub fn drop_message(reason: impl Into<String>) -> Self {
        Self::Drop(reason.into())
    }
}

impl fmt::Display for HookSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopChain(reason) => write!(f, "chain stopped: {reason}"),
            Self::Drop(reason) => write!(f, "dropped: {reason}"),
            Self::Failed(error) => write!(f, "{error}"),
        }
    }
}

impl<E> From<E> for HookSignal
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::Failed(anyhow::Error::new(error))
    }
}

pub type HookResult = Result<(), HookSignal>;

/// A set of optional hooks. Every hook defaults to a no-op.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn before_send(&self, _ctx: &HookContext, _message: &mut Message) -> HookResult {
        Ok(())
    }

    async fn after_send(&self, _ctx: &HookContext, _message: &mut Message) -> HookResult {
        Ok(())
    }

    async fn before_consume(&self, _ctx: &HookContext, _message: &mut Message) -> HookResult {
        Ok(())
    }

    async fn after_consume(&self, _ctx: &HookContext, _message: &mut Message) -> HookResult {
        Ok(())
    }

    async fn before_confirm(&self, _ctx: &HookContext, _message: &mut Message) -> HookResult {
        Ok(())
    }

    async fn after_confirm(&self, _ctx: &HookContext, _message: &mut Message) -> HookResult {
        Ok(())
    }
}

/// Ordered middleware list attached to a step or a broker.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.middlewares.iter().map(|m| m.name().to_string()).collect()
    }

    /// Runs `phase` on every middleware in order.
    ///
    /// `StopChain` ends the walk and counts as success; `Drop` and `Failed`
    /// are returned to the caller.
    pub async fn emit(&self, phase: Phase, ctx: &HookContext, message: &mut Message) -> HookResult {
        for middleware in &self.middlewares {
            let result = match phase {
                Phase::BeforeSend => middleware.before_send(ctx, message).await,
                Phase::AfterSend => middleware.after_send(ctx, message).await,
                Phase::BeforeConsume => middleware.before_consume(ctx, message).await,
                Phase::AfterConsume => middleware.after_consume(ctx, message).await,
                Phase::BeforeConfirm => middleware.before_confirm(ctx, message).await,
                Phase::AfterConfirm => middleware.after_confirm(ctx, message).await,
            };
            match result {
                Ok(()) => {}
                Err(HookSignal::StopChain(reason)) => {
                    debug!(
                        middleware = middleware.name(),
                        phase = phase.as_str(),
                        %reason,
                        "middleware chain stopped"
                    );
                    break;
                }
                Err(signal) => return Err(signal),
            }
        }
        Ok(())
    }
}

impl FromIterator<Arc<dyn Middleware>> for MiddlewareChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Middleware>>>(iter: I) -> Self {
        Self {
            middlewares: iter.into_iter().collect(),
        }
    }
}
