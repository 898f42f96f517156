//! Broker contract: publish, consume, settle, shut down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::middleware::{HookContext, HookSignal, Middleware, MiddlewareChain, Phase};
use crate::domain::Message;
use crate::error::BrokerError;

/// Upper bound for a single receive wait.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Predicate evaluated after each handled message; `true` stops consumption.
pub type CancelPredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Common broker configuration.
#[derive(Clone)]
pub struct BrokerOptions {
    name: String,
    middlewares: MiddlewareChain,
    once: bool,
    cancel_consume: Option<CancelPredicate>,
    poll_interval: Duration,
    prefetch: usize,
}

impl BrokerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            middlewares: MiddlewareChain::new(),
            once: false,
            cancel_consume: None,
            poll_interval: MAX_POLL_INTERVAL,
            prefetch: 1,
        }
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Stop consuming after the first non-empty batch.
    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    pub fn cancel_consume<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.cancel_consume = Some(Arc::new(predicate));
        self
    }

    /// Clamped to `(0, 1s]`.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.clamp(Duration::from_millis(1), MAX_POLL_INTERVAL);
        self
    }

    /// Maximum messages handed out per batch (at least 1).
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

/// State every broker shares: options, shutdown flag, start-once guard.
pub struct BrokerCore {
    options: BrokerOptions,
    shutdown_tx: watch::Sender<bool>,
    consuming: AtomicBool,
}

impl BrokerCore {
    pub fn new(options: BrokerOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            options,
            shutdown_tx,
            consuming: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn middlewares(&self) -> &MiddlewareChain {
        &self.options.middlewares
    }

    pub fn once(&self) -> bool {
        self.options.once
    }

    pub fn cancel_consume(&self) -> Option<&CancelPredicate> {
        self.options.cancel_consume.as_ref()
    }

    pub fn poll_interval(&self) -> Duration {
        self.options.poll_interval
    }

    pub fn prefetch(&self) -> usize {
        self.options.prefetch
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Sets the shutdown flag. Returns `true` only for the call that flipped it.
    pub fn shutdown(&self) -> bool {
        let already = self.shutdown_tx.send_replace(true);
        if !already {
            debug!(broker = %self.name(), "broker shutdown requested");
        }
        !already
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// `true` for the first caller only. Used to start background producers once.
    pub fn mark_consuming(&self) -> bool {
        !self.consuming.swap(true, Ordering::AcqRel)
    }
}

/// A live consumption handle.
#[async_trait]
pub trait MessageSource: Send {
    /// Waits at most one poll interval. An empty batch means "nothing yet".
    async fn next_batch(&mut self) -> Result<Vec<Message>, BrokerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn core(&self) -> &BrokerCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn middlewares(&self) -> &MiddlewareChain {
        self.core().middlewares()
    }

    /// Transport-level publish of already-encoded bytes.
    async fn publish_raw(&self, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Publishes the wire form of `message`, running the broker's send hooks.
    async fn publish(&self, message: &mut Message) -> Result<(), BrokerError> {
        let ctx = HookContext::for_broker(self.name());
        match self.middlewares().emit(Phase::BeforeSend, &ctx, message).await {
            Ok(()) => {}
            Err(HookSignal::Drop(reason)) => {
                warn!(broker = %self.name(), task_id = %message.extra.task_id(), %reason, "message dropped before publish");
                return Ok(());
            }
            Err(signal) => {
                return Err(BrokerError::Middleware {
                    broker: self.name().to_string(),
                    reason: signal.to_string(),
                });
            }
        }

        self.publish_raw(message.to_wire_form(false)).await?;

        if let Err(signal) = self.middlewares().emit(Phase::AfterSend, &ctx, message).await {
            warn!(broker = %self.name(), task_id = %message.extra.task_id(), %signal, "after_send hook failed");
        }
        Ok(())
    }

    async fn consume(&self) -> Result<Box<dyn MessageSource>, BrokerError>;

    async fn confirm(&self, _message: &Message) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn reject(&self, _message: &Message) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Default: reject, then republish either the received bytes
    /// (`is_source`) or the current body and extra.
    async fn requeue(&self, message: &Message, is_source: bool) -> Result<(), BrokerError> {
        self.reject(message).await?;
        let payload = match (is_source, message.raw()) {
            (true, Some(raw)) => raw.payload.clone(),
            _ => message.to_wire_form(false),
        };
        self.publish_raw(payload).await
    }

    /// Idempotent.
    fn shutdown(&self) {
        self.core().shutdown();
    }

    fn is_shutdown(&self) -> bool {
        self.core().is_shutdown()
    }
}

/// Convenience publishing for concrete brokers.
#[async_trait]
pub trait BrokerExt: Broker {
    /// Wraps `body` in a fresh message and publishes it.
    async fn publish_value<V>(&self, body: V) -> Result<(), BrokerError>
    where
        V: Into<Value> + Send + 'static,
    {
        let mut message = Message::new(body.into());
        self.publish(&mut message).await
    }
}

impl<B: Broker + ?Sized> BrokerExt for B {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_flips_once() {
        let core = BrokerCore::new(BrokerOptions::new("b"));
        assert!(!core.is_shutdown());
        assert!(core.shutdown());
        assert!(!core.shutdown());
        assert!(core.is_shutdown());
    }

    #[test]
    fn consuming_guard_fires_once() {
        let core = BrokerCore::new(BrokerOptions::new("b"));
        assert!(core.mark_consuming());
        assert!(!core.mark_consuming());
    }

    #[test]
    fn poll_interval_is_clamped() {
        let core = BrokerCore::new(BrokerOptions::new("b").poll_interval(Duration::from_secs(30)));
        assert_eq!(core.poll_interval(), MAX_POLL_INTERVAL);

        let core = BrokerCore::new(BrokerOptions::new("b").poll_interval(Duration::ZERO));
        assert_eq!(core.poll_interval(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn shutdown_wakes_subscribers() {
        let core = BrokerCore::new(BrokerOptions::new("b"));
        let mut rx = core.subscribe_shutdown();
        core.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
