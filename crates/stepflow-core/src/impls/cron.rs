//! CronBroker - 時刻に合わせて固定 body を publish するブローカー

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::memory::{MemoryBroker, MemoryPublisher};
use crate::domain::{Backoff, Message};
use crate::error::{BrokerError, CronError};
use crate::ports::{Broker, BrokerCore, BrokerOptions, MessageSource};
use crate::schedule::CronSchedule;

/// Upper bound between ticker wake-ups.
const TICK: Duration = Duration::from_secs(1);

/// Publishes `body` every time the schedule fires, into its own memory queue.
///
/// The ticker starts on the first `consume` call and stops when the broker
/// shuts down.
pub struct CronBroker {
    inner: MemoryBroker,
    schedule: Arc<CronSchedule>,
    body: Value,
    start_time: Option<DateTime<Local>>,
}

impl CronBroker {
    pub fn new(options: BrokerOptions, expr: &str, body: impl Into<Value>) -> Result<Self, CronError> {
        Ok(Self {
            inner: MemoryBroker::new(options),
            schedule: Arc::new(CronSchedule::parse(expr)?),
            body: body.into(),
            start_time: None,
        })
    }

    /// Fire times are computed from `start` instead of the first `consume`.
    /// A start in the past fires once for the missed times, then follows
    /// the schedule from now.
    pub fn starting_at(mut self, start: DateTime<Local>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.inner = self.inner.with_backoff(backoff);
        self
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    fn spawn_ticker(&self) {
        let ticker = Ticker {
            broker: self.name().to_string(),
            schedule: Arc::clone(&self.schedule),
            body: self.body.clone(),
            publisher: self.inner.publisher(),
        };
        let start = self.start_time.unwrap_or_else(Local::now);
        let shutdown = self.core().subscribe_shutdown();
        tokio::spawn(ticker.run(start, shutdown));
    }
}

struct Ticker {
    broker: String,
    schedule: Arc<CronSchedule>,
    body: Value,
    publisher: MemoryPublisher,
}

impl Ticker {
    async fn run(self, start: DateTime<Local>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(broker = %self.broker, expr = %self.schedule.expr(), "cron ticker started");
        let mut next = self.schedule.next_after(&start);

        while !*shutdown.borrow() {
            let Some(fire_at) = next else {
                warn!(broker = %self.broker, "cron schedule has no further fire times");
                break;
            };

            let now = Local::now();
            if fire_at <= now {
                let payload = Message::new(self.body.clone()).to_wire_form(false);
                if let Err(e) = self.publisher.push(payload).await {
                    warn!(broker = %self.broker, error = %e, "cron publish failed");
                }
                debug!(broker = %self.broker, %fire_at, "cron fired");
                // 取りこぼした発火時刻はまとめて 1 回として扱う
                next = self.schedule.next_after(&fire_at.max(now));
                continue;
            }

            let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO).min(TICK);
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!(broker = %self.broker, "cron ticker stopped");
    }
}

#[async_trait]
impl Broker for CronBroker {
    fn core(&self) -> &BrokerCore {
        self.inner.core()
    }

    async fn publish_raw(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.inner.publish_raw(payload).await
    }

    async fn consume(&self) -> Result<Box<dyn MessageSource>, BrokerError> {
        if self.core().mark_consuming() {
            self.spawn_ticker();
        }
        self.inner.consume().await
    }

    async fn confirm(&self, message: &Message) -> Result<(), BrokerError> {
        self.inner.confirm(message).await
    }

    async fn reject(&self, message: &Message) -> Result<(), BrokerError> {
        self.inner.reject(message).await
    }

    async fn requeue(&self, message: &Message, is_source: bool) -> Result<(), BrokerError> {
        self.inner.requeue(message, is_source).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn fires_the_fixed_body() {
        let broker = CronBroker::new(
            BrokerOptions::new("tick").poll_interval(Duration::from_millis(100)),
            "@every 1s",
            json!({"kind": "tick"}),
        )
        .unwrap();
        let mut source = broker.consume().await.unwrap();

        let batch = timeout(Duration::from_secs(5), async {
            loop {
                let batch = source.next_batch().await.unwrap();
                if !batch.is_empty() {
                    break batch;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(batch[0].body, json!({"kind": "tick"}));
        broker.shutdown();
    }

    #[tokio::test]
    async fn missed_fire_times_collapse_into_one() {
        let five_years_ago = Local::now() - chrono::Duration::days(5 * 366);
        let broker = CronBroker::new(BrokerOptions::new("catch_up"), "@yearly", json!("tick"))
            .unwrap()
            .starting_at(five_years_ago);
        let _source = broker.consume().await.unwrap();

        timeout(Duration::from_secs(2), async {
            while broker.inner.is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(broker.inner.len(), 1);
        broker.shutdown();
    }

    #[tokio::test]
    async fn invalid_expression_is_rejected_at_construction() {
        let result = CronBroker::new(BrokerOptions::new("bad"), "@every 1w", json!(null));
        assert!(matches!(result, Err(CronError::UnsupportedInterval(_))));
    }

    #[tokio::test]
    async fn ticker_starts_once_for_many_consumers() {
        let broker = CronBroker::new(BrokerOptions::new("tick"), "@yearly", json!(1)).unwrap();
        let _a = broker.consume().await.unwrap();
        let _b = broker.consume().await.unwrap();
        assert!(!broker.core().mark_consuming());
        broker.shutdown();
    }
}
