//! WebhookBroker - 外部から受け取ったペイロードをそのまま配送する
//!
//! The HTTP listener itself is left to the embedding application: it routes
//! requests for [`WebhookBroker::path`] into [`WebhookBroker::ingest`].

use async_trait::async_trait;

use super::memory::MemoryBroker;
use crate::domain::Message;
use crate::error::BrokerError;
use crate::ports::{Broker, BrokerCore, BrokerOptions, MessageSource};

pub struct WebhookBroker {
    path: String,
    inner: MemoryBroker,
}

impl WebhookBroker {
    pub fn new(options: BrokerOptions, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Self {
            path,
            inner: MemoryBroker::new(options),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Accepts one inbound payload.
    ///
    /// A JSON envelope (`body` + `extra`) restores its fields; any other
    /// payload becomes the body of a new message.
    pub async fn ingest(&self, payload: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        if self.is_shutdown() {
            return Err(BrokerError::Closed(self.name().to_string()));
        }
        self.inner.publish_raw(payload.into()).await
    }

    /// Payloads received but not yet consumed.
    pub fn pending(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl Broker for WebhookBroker {
    fn core(&self) -> &BrokerCore {
        self.inner.core()
    }

    async fn publish_raw(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.inner.publish_raw(payload).await
    }

    async fn consume(&self) -> Result<Box<dyn MessageSource>, BrokerError> {
        self.inner.consume().await
    }

    // The sender already got its response; settlement is local bookkeeping only.
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
