//! Worker - 1 つのブローカーを消費して 1 つのステップを駆動するループ
//!
//! # 処理の流れ（メッセージ 1 件）
//! 1. broker を bind、`Received` イベント
//! 2. before_consume（step → broker の順）。Drop なら reject して終了
//! 3. step 実行 + retry 判定（Continue の間は同じメッセージで再実行）
//! 4. 成功: confirm / 打ち切り: callback → reject / キュー再投入: requeue
//! 5. after_consume
//!
//! cancel_consume は処理後に評価し、true ならワーカーを止める。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::events::EventKind;
use super::step::Step;
use crate::domain::{Message, RetryStatus, StepError};
use crate::ports::{Broker, HookResult, HookSignal, MessageSource, Phase};

/// How a worker runs its step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    /// One task per worker, each with its own receive loop.
    #[default]
    Dedicated,
    /// One receive loop per source feeding a bounded pool of handler tasks.
    Pooled,
}

/// Final outcome of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Confirmed,
    Rejected,
    Requeued,
    Dropped,
}

pub struct Worker {
    id: usize,
    step: Arc<Step>,
    broker: Arc<dyn Broker>,
    concurrency: usize,
    stopped: AtomicBool,
}

impl Worker {
    pub fn new(id: usize, step: Arc<Step>, broker: Arc<dyn Broker>) -> Self {
        Self::pooled(id, step, broker, 1)
    }

    /// A single receive loop running up to `size` messages concurrently.
    pub fn pooled(id: usize, step: Arc<Step>, broker: Arc<dyn Broker>, size: usize) -> Self {
        Self {
            id,
            step,
            broker,
            concurrency: size.max(1),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn step(&self) -> &Arc<Step> {
        &self.step
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Stops this worker and its broker. Idempotent.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!(step = %self.step.name(), broker = %self.broker.name(), worker = self.id, "worker shutdown requested");
        }
        self.broker.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.broker.is_shutdown()
    }

    /// Runs until shutdown (explicit, `once`, or `cancel_consume`).
    pub async fn run(self: Arc<Self>) {
        info!(step = %self.step.name(), broker = %self.broker.name(), worker = self.id, concurrency = self.concurrency, "worker started");
        let source = match self.broker.consume().await {
            Ok(source) => source,
            Err(e) => {
                error!(step = %self.step.name(), broker = %self.broker.name(), error = %e, "failed to start consuming");
                return;
            }
        };

        if self.concurrency > 1 {
            Arc::clone(&self).run_pooled(source).await;
        } else {
            self.run_dedicated(source).await;
        }
        info!(step = %self.step.name(), broker = %self.broker.name(), worker = self.id, "worker stopped");
    }

    async fn run_dedicated(&self, mut source: Box<dyn MessageSource>) {
        while !self.is_shutdown() {
            let Some(batch) = self.next_batch(source.as_mut()).await else {
                continue;
            };

            let mut pending = batch.into_iter();
            while let Some(mut message) = pending.next() {
                if self.is_shutdown() {
                    self.release(std::iter::once(message).chain(pending)).await;
                    break;
                }
                self.handle_message(&mut message).await;
                self.check_cancel(&message);
            }

            if self.broker.core().once() {
                self.shutdown();
            }
        }
    }

    async fn run_pooled(self: Arc<Self>, mut source: Box<dyn MessageSource>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        while !self.is_shutdown() {
            let Some(batch) = self.next_batch(source.as_mut()).await else {
                self.reap(&mut tasks);
                continue;
            };

            let mut pending = batch.into_iter();
            while let Some(message) = pending.next() {
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.release(std::iter::once(message).chain(pending)).await;
                        break;
                    }
                };
                if self.is_shutdown() {
                    drop(permit);
                    self.release(std::iter::once(message).chain(pending)).await;
                    break;
                }

                let worker = Arc::clone(&self);
                tasks.spawn(async move {
                    let _permit = permit;
                    let mut message = message;
                    worker.handle_message(&mut message).await;
                    worker.check_cancel(&message);
                });
                self.reap(&mut tasks);
            }

            if self.broker.core().once() {
                self.shutdown();
            }
        }

        // in-flight のハンドラは最後まで走らせる
        while let Some(result) = tasks.join_next().await {
            self.log_join(result);
        }
    }

    async fn next_batch(&self, source: &mut dyn MessageSource) -> Option<Vec<Message>> {
        match source.next_batch().await {
            Ok(batch) if batch.is_empty() => None,
            Ok(batch) => Some(batch),
            Err(e) => {
                error!(step = %self.step.name(), broker = %self.broker.name(), error = %e, "receive failed");
                sleep(self.broker.core().poll_interval()).await;
                None
            }
        }
    }

    fn reap(&self, tasks: &mut JoinSet<()>) {
        while let Some(result) = tasks.try_join_next() {
            self.log_join(result);
        }
    }

    fn log_join(&self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            error!(step = %self.step.name(), broker = %self.broker.name(), worker = self.id, error = %e, "message task failed");
        }
    }

    /// Puts messages received but not handled back, as received.
    async fn release(&self, messages: impl Iterator<Item = Message>) {
        for mut message in messages {
            message.bind_broker(Arc::clone(&self.broker));
            if let Err(e) = message.requeue(true).await {
                error!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), error = %e, "failed to release unhandled message");
            }
        }
    }

    fn check_cancel(&self, message: &Message) {
        if let Some(cancel) = self.broker.core().cancel_consume()
            && cancel(message)
        {
            info!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), "cancel_consume matched, stopping");
            self.shutdown();
        }
    }

    async fn emit_consume(&self, phase: Phase, message: &mut Message) -> HookResult {
        let ctx = self.step.hook_context(Some(self.broker.name()));
        self.step.emit(phase, &ctx, message).await?;
        self.broker.middlewares().emit(phase, &ctx, message).await
    }

    /// Drives one message through hooks, the step and the retry machine,
    /// and settles it.
    pub async fn handle_message(&self, message: &mut Message) -> Disposition {
        message.bind_broker(Arc::clone(&self.broker));
        debug!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), worker = self.id, "message received");
        self.step.events().emit(
            self.step
                .event(EventKind::Received)
                .broker(self.broker.name())
                .task_id(message.extra.task_id()),
        );

        match self.emit_consume(Phase::BeforeConsume, message).await {
            Ok(()) | Err(HookSignal::StopChain(_)) => {}
            Err(HookSignal::Drop(reason)) => return self.drop_message(message, &reason).await,
            Err(HookSignal::Failed(e)) => {
                error!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), error = %e, "before_consume failed");
                self.emit_error(message, &e.to_string());
                self.reject(message).await;
                return Disposition::Rejected;
            }
        }

        let disposition = self.run_with_retry(message).await;
        if disposition == Disposition::Dropped {
            return disposition;
        }

        if let Err(signal) = self.emit_consume(Phase::AfterConsume, message).await {
            warn!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), %signal, "after_consume hook failed");
        }
        disposition
    }

    async fn run_with_retry(&self, message: &mut Message) -> Disposition {
        loop {
            let failure = match self.step.invoke(message).await {
                Ok(()) => {
                    if let Err(e) = message.confirm().await {
                        error!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), error = %e, "confirm failed");
                    }
                    debug!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), "message consumed");
                    self.step.events().emit(
                        self.step
                            .event(EventKind::Consumed)
                            .broker(self.broker.name())
                            .task_id(message.extra.task_id()),
                    );
                    return Disposition::Confirmed;
                }
                Err(StepError::Drop(reason)) => return self.drop_message(message, &reason).await,
                Err(failure) => failure,
            };

            let detail = failure.to_string();
            message.set_exception(failure);
            error!(
                step = %self.step.name(),
                broker = %self.broker.name(),
                task_id = %message.extra.task_id(),
                failure_count = message.failure_count(),
                error = %detail,
                "step failed"
            );
            self.emit_error(message, &detail);

            match self.step.retry().decide(message) {
                RetryStatus::Continue => {
                    debug!(step = %self.step.name(), task_id = %message.extra.task_id(), "retrying in process");
                }
                RetryStatus::EndWithCallback => {
                    if let Some(callback) = self.step.error_callback() {
                        callback.on_error(message).await;
                    }
                    self.reject(message).await;
                    return Disposition::Rejected;
                }
                RetryStatus::EndIgnoreCallback => {
                    if let Err(e) = message.requeue(false).await {
                        error!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), error = %e, "requeue failed");
                    }
                    info!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), failure_count = message.failure_count(), "message requeued");
                    return Disposition::Requeued;
                }
            }
        }
    }

    async fn drop_message(&self, message: &Message, reason: &str) -> Disposition {
        warn!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), %reason, "message dropped");
        self.step.events().emit(
            self.step
                .event(EventKind::Dropped)
                .broker(self.broker.name())
                .task_id(message.extra.task_id())
                .detail(reason),
        );
        self.reject(message).await;
        Disposition::Dropped
    }

    async fn reject(&self, message: &Message) {
        if let Err(e) = message.reject().await {
            error!(step = %self.step.name(), broker = %self.broker.name(), task_id = %message.extra.task_id(), error = %e, "reject failed");
        }
    }

    fn emit_error(&self, message: &Message, detail: &str) {
        self.step.events().emit(
            self.step
                .event(EventKind::Error)
                .broker(self.broker.name())
                .task_id(message.extra.task_id())
                .detail(detail),
        );
    }
}
