//! MemoryBroker - プロセス内の FIFO ブローカー
//!
//! # 学習ポイント
//! - Mutex + Notify による timed receive（ロックを跨いで await しない）
//! - delivery tag による in-flight 管理と二重 settle の検出
//! - 満杯時の publish は backoff 付きでリトライし、最後は transport error

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::domain::{Backoff, Message, RawDelivery};
use crate::error::BrokerError;
use crate::ports::{Broker, BrokerCore, BrokerOptions, MessageSource};

/// Shared queue state.
struct MemoryQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    capacity: Option<usize>,
    notify: Notify,
    next_tag: AtomicU64,
    in_flight: DashMap<u64, Vec<u8>>,
}

impl MemoryQueue {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            next_tag: AtomicU64::new(1),
            in_flight: DashMap::new(),
        }
    }

    /// Hands the payload back when the queue is full.
    fn try_push(&self, payload: Vec<u8>) -> Result<(), Vec<u8>> {
        {
            let mut items = self.items.lock();
            if self.capacity.is_some_and(|cap| items.len() >= cap) {
                return Err(payload);
            }
            items.push_back(payload);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Nacked deliveries go back to the head, past the capacity check.
    fn push_front(&self, payload: Vec<u8>) {
        self.items.lock().push_front(payload);
        self.notify.notify_one();
    }

    /// Requeued deliveries were already admitted once, so they skip the
    /// capacity check too.
    fn push_back_unchecked(&self, payload: Vec<u8>) {
        self.items.lock().push_back(payload);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        let payload = self.items.lock().pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(tag, payload.clone());

        let mut message = Message::from_wire(&payload);
        message.set_raw(RawDelivery {
            payload,
            tag: Some(tag),
        });
        Some(message)
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

/// Cloneable publishing handle onto a [`MemoryBroker`]'s queue.
#[derive(Clone)]
pub struct MemoryPublisher {
    broker: String,
    queue: Arc<MemoryQueue>,
    backoff: Backoff,
}

impl MemoryPublisher {
    pub async fn push(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut payload = payload;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.queue.try_push(payload) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    if !self.backoff.allows_retry(attempts) {
                        return Err(BrokerError::Transport {
                            broker: self.broker.clone(),
                            attempts,
                            reason: "queue is full".to_string(),
                        });
                    }
                    let delay = self.backoff.next_delay(attempts);
                    warn!(broker = %self.broker, attempts, ?delay, "queue full, retrying publish");
                    sleep(delay).await;
                    payload = rejected;
                }
            }
        }
    }
}

/// In-process broker backed by a FIFO queue.
///
/// # 実装詳細
/// - 受信したメッセージは delivery tag 付きで in-flight に登録
/// - confirm / reject で in-flight から外す（reject は再配送しない）
/// - requeue は末尾へ再投入し、容量チェックを通さない（満杯でも失わない）
///
/// # 使用例
/// ```ignore
/// let broker = Arc::new(MemoryBroker::new(BrokerOptions::new("todo")));
/// broker.publish_value(json!({"id": 1})).await?;
/// ```
pub struct MemoryBroker {
    core: BrokerCore,
    queue: Arc<MemoryQueue>,
    backoff: Backoff,
}

impl MemoryBroker {
    /// Unbounded queue.
    pub fn new(options: BrokerOptions) -> Self {
        Self::build(options, None)
    }

    /// Publishing into a full queue backs off, then fails with a transport error.
    pub fn bounded(options: BrokerOptions, capacity: usize) -> Self {
        Self::build(options, Some(capacity.max(1)))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(BrokerOptions::new(name))
    }

    fn build(options: BrokerOptions, capacity: Option<usize>) -> Self {
        Self {
            core: BrokerCore::new(options),
            queue: Arc::new(MemoryQueue::new(capacity)),
            backoff: Backoff::default_publish(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            broker: self.name().to_string(),
            queue: Arc::clone(&self.queue),
            backoff: self.backoff.clone(),
        }
    }

    /// Queued (not yet delivered) messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivered but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.queue.in_flight.len()
    }

    /// Settles a delivery negatively; `requeue` puts the received bytes
    /// back at the head of the queue.
    pub async fn nack(&self, message: &Message, requeue: bool) -> Result<(), BrokerError> {
        if let Some(payload) = self.settle(message, "nack")
            && requeue
        {
            self.queue.push_front(payload);
        }
        Ok(())
    }

    fn settle(&self, message: &Message, action: &'static str) -> Option<Vec<u8>> {
        let tag = message.delivery_tag()?;
        match self.queue.in_flight.remove(&tag) {
            Some((_, payload)) => Some(payload),
            None => {
                debug!(broker = %self.name(), tag, action, "delivery already settled");
                None
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    async fn publish_raw(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.publisher().push(payload).await
    }

    async fn consume(&self) -> Result<Box<dyn MessageSource>, BrokerError> {
        Ok(Box::new(MemorySource::new(self)))
    }

    async fn confirm(&self, message: &Message) -> Result<(), BrokerError> {
        self.settle(message, "confirm");
        Ok(())
    }

    async fn reject(&self, message: &Message) -> Result<(), BrokerError> {
        self.settle(message, "reject");
        Ok(())
    }

    async fn requeue(&self, message: &Message, is_source: bool) -> Result<(), BrokerError> {
        let received = match message.delivery_tag() {
            Some(_) => match self.settle(message, "requeue") {
                Some(payload) => Some(payload),
                None => return Ok(()),
            },
            None => None,
        };
        let payload = match (is_source, received) {
            (true, Some(payload)) => payload,
            _ => message.to_wire_form(false),
        };
        self.queue.push_back_unchecked(payload);
        Ok(())
    }
}

/// Receive handle over a [`MemoryBroker`] queue.
pub struct MemorySource {
    queue: Arc<MemoryQueue>,
    shutdown: watch::Receiver<bool>,
    poll_interval: std::time::Duration,
    prefetch: usize,
}

impl MemorySource {
    fn new(broker: &MemoryBroker) -> Self {
        Self {
            queue: Arc::clone(&broker.queue),
            shutdown: broker.core.subscribe_shutdown(),
            poll_interval: broker.core.poll_interval(),
            prefetch: broker.core.prefetch(),
        }
    }

    fn drain(&self) -> Vec<Message> {
        std::iter::from_fn(|| self.queue.pop())
            .take(self.prefetch)
            .collect()
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_batch(&mut self) -> Result<Vec<Message>, BrokerError> {
        let batch = self.drain();
        if !batch.is_empty() || *self.shutdown.borrow() {
            return Ok(batch);
        }

        // push 通知 / shutdown / poll interval のいずれかで起きる
        let poll_interval = self.poll_interval;
        let queue = Arc::clone(&self.queue);
        let shutdown = &mut self.shutdown;
        let _ = timeout(poll_interval, async move {
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
        })
        .await;

        Ok(self.drain())
    }
}
