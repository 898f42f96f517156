//! StepBuilder - ステップの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 重複登録やワーカー数は register 時に確定

use std::sync::Arc;

use super::events::EventBus;
use super::registry::Registry;
use super::settings::Settings;
use super::step::Step;
use super::worker::WorkerMode;
use crate::domain::{RetryPolicy, TimesRetry};
use crate::error::SetupError;
use crate::ports::{Broker, ErrorCallback, Middleware, MiddlewareChain, StepHandler};

pub const DEFAULT_GROUP: &str = "default";

/// StepBuilder は 1 つのステップを組み立てる
///
/// # 使用例
/// ```ignore
/// let step = StepBuilder::new("print_todo", handler_fn(|m| { println!("{}", m.body); Ok(().into()) }))
///     .from_broker(todo.clone())
///     .workers(3)
///     .retry(AdvancedRetry::local_and_queue(3))
///     .register(&registry)?;
/// ```
pub struct StepBuilder {
    name: String,
    group: String,
    handler: Arc<dyn StepHandler>,
    sources: Vec<Arc<dyn Broker>>,
    destinations: Vec<Arc<dyn Broker>>,
    workers: Option<usize>,
    mode: WorkerMode,
    retry: Arc<dyn RetryPolicy>,
    error_callback: Option<Arc<dyn ErrorCallback>>,
    middlewares: MiddlewareChain,
}

impl StepBuilder {
    /// Defaults: group `default`, one worker per source, `TimesRetry(3)`.
    pub fn new(name: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        Self {
            name: name.into(),
            group: DEFAULT_GROUP.to_string(),
            handler: Arc::new(handler),
            sources: Vec::new(),
            destinations: Vec::new(),
            workers: None,
            mode: WorkerMode::default(),
            retry: Arc::new(TimesRetry::default()),
            error_callback: None,
            middlewares: MiddlewareChain::new(),
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn from_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.sources.push(broker);
        self
    }

    pub fn to_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.destinations.push(broker);
        self
    }

    /// Requested worker count; clamped against the registry settings.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn retry(mut self, retry: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(retry);
        self
    }

    pub fn error_callback(mut self, callback: impl ErrorCallback + 'static) -> Self {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }

    /// Registers into `registry`, creating its workers (not started yet).
    pub fn register(self, registry: &Registry) -> Result<Arc<Step>, SetupError> {
        registry.register(self)
    }

    /// Builds a step outside any registry, with default settings and its
    /// own event bus. Useful for producer-only steps and tests.
    pub fn detached(self) -> Arc<Step> {
        Arc::new(self.finish(&Settings::default(), EventBus::default()))
    }

    pub(crate) fn finish(self, settings: &Settings, events: EventBus) -> Step {
        let workers = settings.resolve_workers(self.workers);
        if let Some(requested) = self.workers
            && requested > settings.workers.max
        {
            tracing::warn!(
                step = %self.name,
                requested,
                max = settings.workers.max,
                "worker count clamped"
            );
        }
        Step {
            name: self.name,
            group: self.group,
            sources: self.sources,
            destinations: self.destinations,
            workers,
            mode: self.mode,
            handler: self.handler,
            retry: self.retry,
            error_callback: self.error_callback,
            middlewares: self.middlewares,
            events,
        }
    }
}
