//! Middlewares and the bundled brokers driven through real workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use stepflow_core::app::{Disposition, Registry, StepBuilder, Worker};
use stepflow_core::domain::Message;
use stepflow_core::impls::{
    ConfigMiddleware, CronBroker, MemoryBroker, MemoryConfigSource, UniqueMiddleware, WebhookBroker,
};
use stepflow_core::ports::{
    Broker, BrokerExt, BrokerOptions, HookContext, HookResult, HookSignal, Middleware, StepOutput,
    StepResult, handler_fn,
};
use tokio::time::timeout;

fn options(name: &str) -> BrokerOptions {
    BrokerOptions::new(name).poll_interval(Duration::from_millis(20))
}

async fn receive(broker: &dyn Broker) -> Message {
    let mut source = broker.consume().await.unwrap();
    source.next_batch().await.unwrap().remove(0)
}

fn recorder(log: &Arc<Mutex<Vec<Value>>>) -> impl Fn(&mut Message) -> StepResult + Send + Sync + 'static {
    let log = Arc::clone(log);
    move |message: &mut Message| {
        log.lock().push(message.body.clone());
        Ok(StepOutput::Nothing)
    }
}

#[tokio::test]
async fn unique_middleware_drops_repeated_bodies() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let step = StepBuilder::new("dedup", handler_fn(recorder(&log)))
        .middleware(UniqueMiddleware::in_memory())
        .detached();
    let broker = Arc::new(MemoryBroker::new(options("events")));
    let worker = Worker::new(0, step, broker.clone());

    let mut outcomes = Vec::new();
    for body in [json!("a"), json!("a"), json!("b")] {
        broker.publish_value(body).await.unwrap();
        let mut message = receive(broker.as_ref()).await;
        outcomes.push(worker.handle_message(&mut message).await);
    }

    assert_eq!(
        outcomes,
        vec![Disposition::Confirmed, Disposition::Dropped, Disposition::Confirmed]
    );
    assert_eq!(*log.lock(), vec![json!("a"), json!("b")]);
    assert_eq!(broker.in_flight(), 0);
}

struct Stop;

#[async_trait]
impl Middleware for Stop {
    async fn before_consume(&self, _ctx: &HookContext, _message: &mut Message) -> HookResult {
        Err(HookSignal::stop("enough"))
    }
}

struct Touch;

#[async_trait]
impl Middleware for Touch {
    async fn before_consume(&self, _ctx: &HookContext, message: &mut Message) -> HookResult {
        message.extra.set("touched", json!(true));
        Ok(())
    }
}

#[tokio::test]
async fn stop_chain_skips_later_hooks_but_runs_the_step() {
    let touched = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&touched);
    let step = StepBuilder::new(
        "guarded",
        handler_fn(move |message: &mut Message| {
            *seen.lock() = Some(message.extra.get("touched").is_some());
            Ok(StepOutput::Nothing)
        }),
    )
    .middleware(Stop)
    .middleware(Touch)
    .detached();
    let broker = Arc::new(MemoryBroker::new(options("chain")));
    let worker = Worker::new(0, step, broker.clone());

    broker.publish_value(json!(1)).await.unwrap();
    let mut message = receive(broker.as_ref()).await;

    assert_eq!(worker.handle_message(&mut message).await, Disposition::Confirmed);
    assert_eq!(*touched.lock(), Some(false));
}

#[tokio::test]
async fn broker_middlewares_guard_consumption_too() {
    let broker = Arc::new(MemoryBroker::new(options("guarded").middleware(UniqueMiddleware::in_memory())));
    let log = Arc::new(Mutex::new(Vec::new()));
    let step = StepBuilder::new("plain", handler_fn(recorder(&log))).detached();
    let worker = Worker::new(0, step, broker.clone());

    for _ in 0..2 {
        broker.publish_value(json!({"id": 1})).await.unwrap();
        let mut message = receive(broker.as_ref()).await;
        worker.handle_message(&mut message).await;
    }

    assert_eq!(log.lock().len(), 1);
}

#[tokio::test]
async fn config_middleware_attaches_both_scopes() {
    let durable = MemoryConfigSource::new();
    durable.set("limits", json!({"max": 5}));
    let transient = MemoryConfigSource::new();
    transient.set("token", json!("s3cret"));

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let out = Arc::new(MemoryBroker::new(options("out")));
    let step = StepBuilder::new(
        "configured",
        handler_fn(move |message: &mut Message| {
            *sink.lock() = message.config.clone();
            Ok(StepOutput::from(message.clone()))
        }),
    )
    .middleware(ConfigMiddleware::durable(durable, "limits"))
    .middleware(ConfigMiddleware::transient(transient, "token"))
    .to_broker(out.clone())
    .detached();
    let source = Arc::new(MemoryBroker::new(options("in")));
    let worker = Worker::new(0, step, source.clone());

    source.publish_value(json!("job")).await.unwrap();
    let mut message = receive(source.as_ref()).await;
    worker.handle_message(&mut message).await;

    assert_eq!(*seen.lock(), Some(json!("s3cret")));
    let forwarded = receive(out.as_ref()).await;
    assert_eq!(forwarded.extra.config(), Some(&json!({"max": 5})));
    assert_eq!(forwarded.config, None);
}

#[tokio::test]
async fn requeue_chooses_received_or_current_form() {
    let broker = Arc::new(MemoryBroker::new(options("requeue")));
    broker.publish_value(json!({"v": 1})).await.unwrap();

    let mut message = receive(broker.as_ref()).await;
    message.body = json!({"v": 2});
    broker.requeue(&message, true).await.unwrap();

    let mut again = receive(broker.as_ref()).await;
    assert_eq!(again.body, json!({"v": 1}));
    assert_eq!(again.extra.task_id(), message.extra.task_id());

    again.body = json!({"v": 3});
    broker.requeue(&again, false).await.unwrap();
    assert_eq!(receive(broker.as_ref()).await.body, json!({"v": 3}));
}

#[tokio::test]
async fn reject_does_not_redeliver() {
    let broker = Arc::new(MemoryBroker::new(options("reject")));
    broker.publish_value(json!(1)).await.unwrap();

    let message = receive(broker.as_ref()).await;
    broker.reject(&message).await.unwrap();

    assert!(broker.is_empty());
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn webhook_payloads_reach_the_step() {
    let hook = Arc::new(WebhookBroker::new(options("github").once(true).prefetch(2), "hooks/github"));
    hook.ingest("ping").await.unwrap();
    hook.ingest(br#"{"action": "opened"}"#.to_vec()).await.unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new();
    StepBuilder::new("on_hook", handler_fn(recorder(&log)))
        .from_broker(hook.clone())
        .register(&registry)
        .unwrap();

    timeout(Duration::from_secs(2), registry.wait(None)).await.unwrap();

    assert_eq!(*log.lock(), vec![json!("ping"), json!({"action": "opened"})]);
    assert!(hook.ingest("late").await.is_err());
}

#[tokio::test]
async fn cron_broker_feeds_its_body_on_schedule() {
    let cron = Arc::new(CronBroker::new(options("tick").once(true), "@every 1s", json!({"tick": true})).unwrap());

    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new();
    StepBuilder::new("on_tick", handler_fn(recorder(&log)))
        .from_broker(cron.clone())
        .register(&registry)
        .unwrap();

    timeout(Duration::from_secs(3), registry.wait(None)).await.unwrap();

    assert_eq!(*log.lock(), vec![json!({"tick": true})]);
}
