//! Worker loop behaviour end to end over the in-memory broker.

use std::io;
use std::num::ParseIntError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use stepflow_core::app::{Disposition, Registry, StepBuilder, Worker};
use stepflow_core::domain::{AdvancedRetry, Message, StepError};
use stepflow_core::impls::MemoryBroker;
use stepflow_core::ports::{
    Broker, BrokerExt, BrokerOptions, StepOutput, async_handler_fn, handler_fn,
};
use tokio::time::timeout;

fn options(name: &str) -> BrokerOptions {
    BrokerOptions::new(name).poll_interval(Duration::from_millis(20))
}

async fn fill(broker: &MemoryBroker, bodies: impl IntoIterator<Item = Value>) {
    for body in bodies {
        broker.publish_value(body).await.unwrap();
    }
}

async fn receive(broker: &MemoryBroker) -> Message {
    let mut source = broker.consume().await.unwrap();
    source.next_batch().await.unwrap().remove(0)
}

async fn wait_for(registry: &Registry) {
    timeout(Duration::from_secs(3), registry.wait(None))
        .await
        .expect("registry should stop on its own");
}

#[tokio::test]
async fn advanced_retry_retries_listed_errors_only() {
    let calls = Arc::new(AtomicU32::new(0));
    let callbacks = Arc::new(Mutex::new(Vec::new()));

    let counter = Arc::clone(&calls);
    let sink = Arc::clone(&callbacks);
    let step = StepBuilder::new(
        "parse",
        handler_fn(move |message: &mut Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            match message.body.as_str() {
                Some("io") => Err(io::Error::other("disk gone").into()),
                Some(text) => {
                    let n: i32 = text.parse()?;
                    Ok(StepOutput::from(json!(n)))
                }
                None => Ok(StepOutput::Nothing),
            }
        }),
    )
    .retry(AdvancedRetry::new(3).on::<ParseIntError>())
    .error_callback(move |message: &Message| sink.lock().push(message.failure_count()))
    .detached();

    let broker = Arc::new(MemoryBroker::new(options("numbers")));
    let worker = Worker::new(0, step, broker.clone());

    fill(&broker, [json!("x")]).await;
    let mut listed = receive(&broker).await;
    assert_eq!(worker.handle_message(&mut listed).await, Disposition::Rejected);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    fill(&broker, [json!("io")]).await;
    let mut unlisted = receive(&broker).await;
    assert_eq!(worker.handle_message(&mut unlisted).await, Disposition::Rejected);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    assert_eq!(*callbacks.lock(), vec![3, 1]);
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn once_handles_a_single_batch() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let broker = Arc::new(MemoryBroker::new(options("once").once(true)));
    fill(&broker, [json!(1), json!(2), json!(3)]).await;

    let registry = Registry::new();
    StepBuilder::new(
        "single",
        handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::Nothing)
        }),
    )
    .from_broker(broker.clone())
    .register(&registry)
    .unwrap();

    wait_for(&registry).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.len(), 2);
    assert!(broker.is_shutdown());
}

#[tokio::test]
async fn cancel_consume_stops_after_the_sentinel() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let broker = Arc::new(MemoryBroker::new(
        options("sentinel").cancel_consume(|message: &Message| message.body == json!("over")),
    ));
    fill(&broker, [json!(0), json!(1), json!("over"), json!(5)]).await;

    let registry = Registry::new();
    StepBuilder::new(
        "until_over",
        handler_fn(move |message: &mut Message| {
            sink.lock().push(message.body.clone());
            Ok(StepOutput::Nothing)
        }),
    )
    .from_broker(broker.clone())
    .register(&registry)
    .unwrap();

    wait_for(&registry).await;

    assert_eq!(*seen.lock(), vec![json!(0), json!(1), json!("over")]);
    assert_eq!(broker.len(), 1);
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn unhandled_prefetched_messages_are_released_on_shutdown() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let broker = Arc::new(MemoryBroker::new(
        options("prefetch")
            .prefetch(3)
            .cancel_consume(|message: &Message| message.body == json!("stop")),
    ));
    fill(&broker, [json!("stop"), json!(1), json!(2)]).await;

    let registry = Registry::new();
    StepBuilder::new(
        "first_only",
        handler_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::Nothing)
        }),
    )
    .from_broker(broker.clone())
    .register(&registry)
    .unwrap();

    wait_for(&registry).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.len(), 2);
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn failure_count_survives_queue_requeue() {
    let counts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&counts);
    let broker = Arc::new(MemoryBroker::new(
        options("flaky").cancel_consume(|message: &Message| !message.failed()),
    ));
    fill(&broker, [json!({"job": 1})]).await;

    let registry = Registry::new();
    StepBuilder::new(
        "eventually",
        handler_fn(move |message: &mut Message| {
            sink.lock().push(message.failure_count());
            if message.failure_count() < 2 {
                return Err(StepError::retry_queue("upstream busy"));
            }
            Ok(StepOutput::Nothing)
        }),
    )
    .retry(AdvancedRetry::local_and_queue(3))
    .from_broker(broker.clone())
    .register(&registry)
    .unwrap();

    wait_for(&registry).await;

    assert_eq!(*counts.lock(), vec![0, 1, 2]);
    assert!(broker.is_empty());
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn async_step_progress_survives_queue_requeue() {
    let step = StepBuilder::new(
        "fetch",
        async_handler_fn(|mut message: Message| async move {
            let progress = message.body["progress"].as_i64().unwrap_or_default();
            message.body = json!({ "progress": progress + 1 });
            if progress == 0 {
                return (message, Err(StepError::retry_queue("partial")));
            }
            (message, Ok(StepOutput::Nothing))
        }),
    )
    .retry(AdvancedRetry::local_and_queue(3))
    .detached();

    let broker = Arc::new(MemoryBroker::new(options("progress")));
    let worker = Worker::new(0, step, broker.clone());
    fill(&broker, [json!({ "progress": 0 })]).await;

    let mut first = receive(&broker).await;
    assert_eq!(worker.handle_message(&mut first).await, Disposition::Requeued);

    let mut again = receive(&broker).await;
    assert_eq!(again.body, json!({ "progress": 1 }));
    assert_eq!(again.failure_count(), 1);
    assert_eq!(worker.handle_message(&mut again).await, Disposition::Confirmed);
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn results_flow_to_destination_brokers() {
    let source = Arc::new(MemoryBroker::new(options("in").once(true).prefetch(2)));
    let sink = Arc::new(MemoryBroker::new(options("out")));
    fill(&source, [json!(2), json!(5)]).await;

    let registry = Registry::new();
    StepBuilder::new(
        "square",
        handler_fn(|message: &mut Message| {
            let n = message.body.as_i64().unwrap_or_default();
            Ok(StepOutput::from(json!(n * n)))
        }),
    )
    .from_broker(source.clone())
    .to_broker(sink.clone())
    .register(&registry)
    .unwrap();

    wait_for(&registry).await;

    assert_eq!(receive(&sink).await.body, json!(4));
    assert_eq!(receive(&sink).await.body, json!(25));
}

#[tokio::test]
async fn mixed_outcomes_follow_the_advanced_policy() {
    let callbacks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&callbacks);
    let step = StepBuilder::new(
        "mixed",
        handler_fn(|message: &mut Message| {
            let failures = message.failure_count();
            match message.body["kind"].as_str() {
                Some("queue") if failures < 2 => Err(StepError::retry_queue("busy")),
                Some("parse") if failures < 2 => {
                    "nan".parse::<i32>()?;
                    Ok(StepOutput::Nothing)
                }
                Some("other") => Err(io::Error::other("unexpected").into()),
                _ => Ok(StepOutput::Nothing),
            }
        }),
    )
    .retry(AdvancedRetry::new(3).on::<ParseIntError>())
    .error_callback(move |message: &Message| sink.lock().push(message.body["kind"].clone()))
    .detached();

    let broker = Arc::new(MemoryBroker::new(options("mixed")));
    let worker = Worker::new(0, step, broker.clone());
    fill(
        &broker,
        ["ok", "queue", "parse", "other"].map(|kind| json!({ "kind": kind })),
    )
    .await;

    let mut source = broker.consume().await.unwrap();
    let mut outcomes = Vec::new();
    while !broker.is_empty() {
        for mut message in source.next_batch().await.unwrap() {
            let kind = message.body["kind"].as_str().unwrap_or_default().to_string();
            outcomes.push((kind, worker.handle_message(&mut message).await));
        }
    }

    let expected = [
        ("ok", Disposition::Confirmed),
        ("queue", Disposition::Requeued),
        ("parse", Disposition::Confirmed),
        ("other", Disposition::Rejected),
        ("queue", Disposition::Requeued),
        ("queue", Disposition::Confirmed),
    ]
    .map(|(kind, outcome)| (kind.to_string(), outcome));
    assert_eq!(outcomes, expected);
    assert_eq!(*callbacks.lock(), vec![json!("other")]);
    assert_eq!(broker.in_flight(), 0);
}
