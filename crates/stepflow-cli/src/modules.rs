//! 組み込みのステップモジュール
//!
//! `stepflow memory retry` のように名前で選んで登録する。
//! パス形式（`demos/memory.rs`, `a/b`）も受け付け、最後の要素だけを使う。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use stepflow_core::app::{Registry, StepBuilder};
use stepflow_core::domain::{AdvancedRetry, Message, StepError};
use stepflow_core::error::SetupError;
use stepflow_core::impls::{CronBroker, MemoryBroker, UniqueMiddleware};
use stepflow_core::ports::{
    BrokerExt, HookContext, HookResult, Middleware, StepOutput, handler_fn,
};
use tracing::{info, warn};

pub const CATALOGUE: &[&str] = &["memory", "cron", "retry"];

/// `demos/memory.rs` → `memory`, `a\b` → `b`, `pkg.retry` → `retry`.
pub fn normalise(name: &str) -> String {
    let trimmed = name.trim().trim_end_matches(".rs");
    trimmed
        .split(['/', '\\', '.'])
        .filter(|part| !part.is_empty())
        .last()
        .unwrap_or_default()
        .to_string()
}

/// Registers the named module. `Ok(false)` means no such module.
pub async fn load(name: &str, registry: &Registry) -> Result<bool, SetupError> {
    match normalise(name).as_str() {
        "memory" => memory(registry).await?,
        "cron" => cron(registry)?,
        "retry" => retry(registry).await?,
        _ => return Ok(false),
    }
    Ok(true)
}

#[derive(Debug, Deserialize)]
struct Todo {
    id: u32,
    title: String,
}

/// Logs how long each message waited between publish and handling.
struct Latency;

#[async_trait]
impl Middleware for Latency {
    fn name(&self) -> &str {
        "latency"
    }

    async fn after_consume(&self, ctx: &HookContext, message: &mut Message) -> HookResult {
        let now = chrono::Local::now().timestamp_millis() as f64 / 1000.0;
        info!(
            step = ctx.step.as_deref().unwrap_or("-"),
            task_id = %message.extra.task_id(),
            latency_secs = now - message.extra.publish_time(),
            "message handled"
        );
        Ok(())
    }
}

/// Fills the `todo` queue (with one duplicate) and drains it with
/// `print_todo` until the `done` sentinel arrives.
async fn memory(registry: &Registry) -> Result<(), SetupError> {
    let settings = registry.settings();
    let todo = Arc::new(
        MemoryBroker::new(
            settings
                .broker_options("todo")
                .middleware(UniqueMiddleware::in_memory())
                .cancel_consume(|message: &Message| message.body == json!("done")),
        )
        .with_backoff(settings.publish_backoff()),
    );

    let todos = (1..=5)
        .map(|id| json!({ "id": id, "title": format!("todo #{id}") }))
        .chain([json!({ "id": 1, "title": "todo #1" }), json!("done")]);
    for body in todos {
        todo.publish_value(body).await?;
    }

    StepBuilder::new(
        "print_todo",
        handler_fn(|message: &mut Message| {
            if message.body == json!("done") {
                return Ok(StepOutput::Nothing);
            }
            let todo: Todo = serde_json::from_value(message.body.clone())?;
            println!("[{}] {}", todo.id, todo.title);
            Ok(StepOutput::Nothing)
        }),
    )
    .from_broker(todo)
    .middleware(Latency)
    .register(registry)?;
    Ok(())
}

/// Prints a heartbeat every five seconds until interrupted.
fn cron(registry: &Registry) -> Result<(), SetupError> {
    let ticks = Arc::new(CronBroker::new(
        registry.settings().broker_options("heartbeat"),
        "@every 5s",
        json!({ "beat": true }),
    )?);

    StepBuilder::new(
        "heartbeat",
        handler_fn(|message: &mut Message| {
            println!("beat at {}", chrono::Local::now().format("%H:%M:%S"));
            info!(task_id = %message.extra.task_id(), "heartbeat");
            Ok(StepOutput::Nothing)
        }),
    )
    .group("cron")
    .from_broker(ticks)
    .register(registry)?;
    Ok(())
}

/// A flaky step that succeeds on the third local attempt, and one that
/// always fails and lands in the error callback.
async fn retry(registry: &Registry) -> Result<(), SetupError> {
    let jobs = Arc::new(
        MemoryBroker::new(
            registry
                .settings()
                .broker_options("jobs")
                .cancel_consume(|message: &Message| message.body == json!({ "kind": "last" })),
        )
        .with_backoff(registry.settings().publish_backoff()),
    );
    for body in [json!({ "kind": "flaky" }), json!({ "kind": "broken" }), json!({ "kind": "last" })] {
        jobs.publish_value(body).await?;
    }

    let attempts = Arc::new(AtomicU32::new(0));
    StepBuilder::new(
        "unreliable",
        handler_fn(move |message: &mut Message| match message.body["kind"].as_str() {
            Some("flaky") if attempts.fetch_add(1, Ordering::SeqCst) < 2 => {
                Err(StepError::retry_local("warming up"))
            }
            Some("broken") => Err(StepError::msg("this job never works")),
            _ => {
                println!("done: {}", message.body);
                Ok(StepOutput::Nothing)
            }
        }),
    )
    .from_broker(jobs)
    .retry(AdvancedRetry::local_and_queue(3))
    .error_callback(|message: &Message| {
        warn!(
            task_id = %message.extra.task_id(),
            failures = message.failure_count(),
            error = message.exception().map(|e| e.message()).unwrap_or_default(),
            "giving up"
        );
    })
    .register(registry)?;
    Ok(())
}
