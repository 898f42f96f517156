//! Step - ユーザー関数とその入出力ブローカーの束
//!
//! A step owns its handler, retry policy, middlewares and the brokers it
//! consumes from / sends to. Workers drive it; [`Step::send`] is also usable
//! directly for producer-only steps.

use std::sync::Arc;

use tracing::{debug, warn};

use super::events::{EventBus, EventKind, StepEvent};
use super::worker::WorkerMode;
use crate::domain::{Message, RetryPolicy, StepError};
use crate::ports::{
    Broker, ErrorCallback, HookContext, HookResult, HookSignal, MiddlewareChain, Phase,
    StepHandler, StepOutput,
};

pub struct Step {
    pub(crate) name: String,
    pub(crate) group: String,
    pub(crate) sources: Vec<Arc<dyn Broker>>,
    pub(crate) destinations: Vec<Arc<dyn Broker>>,
    pub(crate) workers: usize,
    pub(crate) mode: WorkerMode,
    pub(crate) handler: Arc<dyn StepHandler>,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) error_callback: Option<Arc<dyn ErrorCallback>>,
    pub(crate) middlewares: MiddlewareChain,
    pub(crate) events: EventBus,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl Step {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn sources(&self) -> &[Arc<dyn Broker>] {
        &self.sources
    }

    pub fn destinations(&self) -> &[Arc<dyn Broker>] {
        &self.destinations
    }

    /// Resolved worker count (after clamping).
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    pub fn retry(&self) -> &dyn RetryPolicy {
        self.retry.as_ref()
    }

    pub fn error_callback(&self) -> Option<&Arc<dyn ErrorCallback>> {
        self.error_callback.as_ref()
    }

    pub fn middlewares(&self) -> &MiddlewareChain {
        &self.middlewares
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn hook_context(&self, broker: Option<&str>) -> HookContext {
        let ctx = HookContext::for_step(&self.name);
        match broker {
            Some(broker) => ctx.with_broker(broker),
            None => ctx,
        }
    }

    pub(crate) fn event(&self, kind: EventKind) -> StepEvent {
        StepEvent::new(kind).group(&self.group).step(&self.name)
    }

    pub(crate) async fn emit(&self, phase: Phase, ctx: &HookContext, message: &mut Message) -> HookResult {
        self.middlewares.emit(phase, ctx, message).await
    }

    /// Runs the handler once and sends whatever it returns.
    pub async fn invoke(&self, message: &mut Message) -> Result<(), StepError> {
        let output = self.handler.handle(message).await?;
        self.send(output).await
    }

    /// Sends to the step's destination brokers.
    pub async fn send(&self, output: impl Into<StepOutput>) -> Result<(), StepError> {
        self.send_to(output, &self.destinations).await
    }

    /// Sends every non-empty item of `output` to each of `brokers`.
    ///
    /// Empty bodies (`null`, `""`, `[]`, `{}`) and an empty broker list are
    /// skipped. A transport failure aborts and is returned to the caller.
    pub async fn send_to(
        &self,
        output: impl Into<StepOutput>,
        brokers: &[Arc<dyn Broker>],
    ) -> Result<(), StepError> {
        for message in output.into().into_messages() {
            self.send_one(message, brokers).await?;
        }
        Ok(())
    }

    async fn send_one(&self, mut message: Message, brokers: &[Arc<dyn Broker>]) -> Result<(), StepError> {
        let ctx = self.hook_context(None);
        match self.emit(Phase::BeforeSend, &ctx, &mut message).await {
            Ok(()) => {}
            Err(HookSignal::Drop(reason)) => {
                warn!(step = %self.name, task_id = %message.extra.task_id(), %reason, "message dropped before send");
                self.events.emit(
                    self.event(EventKind::Dropped)
                        .task_id(message.extra.task_id())
                        .detail(reason),
                );
                return Ok(());
            }
            Err(HookSignal::Failed(error)) => return Err(StepError::Failed(error)),
            Err(HookSignal::StopChain(_)) => {}
        }

        if brokers.is_empty() {
            debug!(step = %self.name, "no destination brokers, nothing sent");
            return Ok(());
        }
        if is_empty_body(&message.body) {
            debug!(step = %self.name, "empty body, nothing sent");
            return Ok(());
        }

        for broker in brokers {
            broker.publish(&mut message).await?;
            debug!(step = %self.name, broker = %broker.name(), task_id = %message.extra.task_id(), "message sent");
            self.events.emit(
                self.event(EventKind::Sent)
                    .broker(broker.name())
                    .task_id(message.extra.task_id()),
            );
        }

        match self.emit(Phase::AfterSend, &ctx, &mut message).await {
            Err(HookSignal::Failed(error)) => Err(StepError::Failed(error)),
            _ => Ok(()),
        }
    }
}

/// `null`, `""`, `[]` and `{}` are not worth sending.
pub fn is_empty_body(body: &serde_json::Value) -> bool {
    use serde_json::Value;
    match body {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use rstest::rstest;
    use serde_json::{Value, json};

    use super::*;
    use crate::app::StepBuilder;
    use crate::impls::MemoryBroker;
    use crate::ports::{BrokerOptions, Middleware, handler_fn};

    fn sink() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::new(
            BrokerOptions::new("sink").poll_interval(Duration::from_millis(20)),
        ))
    }

    fn noop_step(destinations: Vec<Arc<dyn Broker>>) -> Arc<Step> {
        let mut builder = StepBuilder::new("producer", handler_fn(|_| Ok(StepOutput::Nothing)));
        for broker in destinations {
            builder = builder.to_broker(broker);
        }
        builder.detached()
    }

    #[rstest]
    #[case::null(json!(null), true)]
    #[case::empty_string(json!(""), true)]
    #[case::empty_list(json!([]), true)]
    #[case::empty_map(json!({}), true)]
    #[case::zero(json!(0), false)]
    #[case::false_flag(json!(false), false)]
    #[case::text(json!("x"), false)]
    fn empty_bodies(#[case] body: Value, #[case] empty: bool) {
        assert_eq!(is_empty_body(&body), empty);
    }

    #[tokio::test]
    async fn send_publishes_each_item_to_every_destination() {
        let a = sink();
        let b = sink();
        let step = noop_step(vec![a.clone() as Arc<dyn Broker>, b.clone() as Arc<dyn Broker>]);

        step.send(vec![json!(1), json!(""), json!(2)]).await.unwrap();

        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
    }

    #[tokio::test]
    async fn send_without_destinations_is_a_noop() {
        let step = noop_step(Vec::new());
        assert!(step.send(json!({"x": 1})).await.is_ok());
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_step_error() {
        let full = Arc::new(
            MemoryBroker::bounded(BrokerOptions::new("full"), 1).with_backoff(crate::domain::Backoff {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
                multiplier: 1.0,
                jitter: false,
            }),
        );
        let step = noop_step(vec![full.clone() as Arc<dyn Broker>]);

        step.send(json!(1)).await.unwrap();
        let err = step.send(json!(2)).await.unwrap_err();
        assert!(matches!(err, StepError::Failed(_)));
    }

    struct DropOdd;

    #[async_trait]
    impl Middleware for DropOdd {
        async fn before_send(&self, _ctx: &HookContext, message: &mut Message) -> HookResult {
            if message.body.as_i64().is_some_and(|n| n % 2 == 1) {
                return Err(HookSignal::drop_message("odd"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn before_send_drop_skips_only_that_item() {
        let out = sink();
        let step = StepBuilder::new("producer", handler_fn(|_| Ok(StepOutput::Nothing)))
            .to_broker(out.clone())
            .middleware(DropOdd)
            .detached();

        step.send(vec![json!(1), json!(2), json!(3), json!(4)]).await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn invoke_sends_handler_output() {
        let out = sink();
        let step = StepBuilder::new(
            "double",
            handler_fn(|message: &mut Message| {
                let n = message.body.as_i64().unwrap_or_default();
                Ok(StepOutput::from(json!(n * 2)))
            }),
        )
        .to_broker(out.clone())
        .detached();

        step.invoke(&mut Message::new(json!(21))).await.unwrap();

        let mut source = out.consume().await.unwrap();
        let sent = source.next_batch().await.unwrap().remove(0);
        assert_eq!(sent.body, json!(42));
    }
}
