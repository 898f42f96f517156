//! Message envelope: body + durable metadata + transient delivery state.
//!
//! Wire form is a JSON object `{"body": .., "extra": {..}}`. Only `body`
//! and `extra` travel; the raw delivery, the bound broker, the captured
//! exception and the transient `config` stay in-process.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use super::failure::{CapturedError, StepError};
use crate::error::{BrokerError, MessageError};
use crate::ports::broker::Broker;
use crate::ports::middleware::{HookContext, Phase};

/// Keys of [`Extra`] that are managed by the envelope itself.
pub const RESERVED_EXTRA_KEYS: [&str; 3] = ["task_id", "publish_time", "failure_count"];

fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

fn now_epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Durable metadata carried alongside the body.
///
/// Unknown keys are kept in `fields` and survive a wire round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extra {
    #[serde(default = "new_task_id")]
    task_id: String,
    #[serde(default = "now_epoch_seconds")]
    publish_time: f64,
    #[serde(default)]
    failure_count: u32,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Extra {
    /// Fresh metadata: new task id, publish time = now, no failures.
    pub fn new() -> Self {
        Self {
            task_id: new_task_id(),
            publish_time: now_epoch_seconds(),
            failure_count: 0,
            fields: Map::new(),
        }
    }

    /// Rebuilds metadata from previously stored values.
    pub fn restore(task_id: impl Into<String>, publish_time: f64, failure_count: u32) -> Self {
        Self {
            task_id: task_id.into(),
            publish_time,
            failure_count,
            fields: Map::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn publish_time(&self) -> f64 {
        self.publish_time
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Sets an additional key. Reserved keys are ignored and reported as `false`.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if RESERVED_EXTRA_KEYS.contains(&key.as_str()) {
            warn!(%key, "reserved extra key cannot be overwritten");
            return false;
        }
        self.fields.insert(key, value);
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Durable configuration attached by a config middleware.
    pub fn config(&self) -> Option<&Value> {
        self.fields.get("config")
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 3);
        map.insert("task_id".into(), Value::String(self.task_id.clone()));
        map.insert("publish_time".into(), Value::from(self.publish_time));
        map.insert("failure_count".into(), Value::from(self.failure_count));
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }

    fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
    }
}

impl Default for Extra {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport-level delivery the message was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    /// Bytes exactly as received.
    pub payload: Vec<u8>,
    /// Broker-specific settlement handle.
    pub tag: Option<u64>,
}

/// The unit of work that flows between brokers and steps.
#[derive(Clone)]
pub struct Message {
    pub body: Value,
    pub extra: Extra,
    /// Transient configuration; never serialized.
    pub config: Option<Value>,
    raw: Option<RawDelivery>,
    exception: Option<CapturedError>,
    broker: Option<Arc<dyn Broker>>,
}

impl Message {
    pub fn new(body: impl Into<Value>) -> Self {
        Self::with_extra(body, Extra::new())
    }

    pub fn with_extra(body: impl Into<Value>, extra: Extra) -> Self {
        Self {
            body: body.into(),
            extra,
            config: None,
            raw: None,
            exception: None,
            broker: None,
        }
    }

    /// Decodes a delivery.
    ///
    /// An envelope object restores body and extra. Any other JSON payload
    /// becomes the body of a fresh message; non-JSON bytes become a string body.
    pub fn from_wire(payload: &[u8]) -> Self {
        let mut message = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) if is_envelope(&map) => Self::from_envelope(map),
            Ok(value) => Self::new(value),
            Err(_) => Self::new(Value::String(String::from_utf8_lossy(payload).into_owned())),
        };
        message.raw = Some(RawDelivery {
            payload: payload.to_vec(),
            tag: None,
        });
        message
    }

    fn from_envelope(mut map: Map<String, Value>) -> Self {
        let body = map.remove("body").unwrap_or(Value::Null);
        let extra = match map.remove("extra").map(serde_json::from_value::<Extra>) {
            Some(Ok(extra)) => extra,
            Some(Err(e)) => {
                warn!(error = %e, "malformed extra in envelope, using fresh metadata");
                Extra::new()
            }
            None => Extra::new(),
        };
        Self::with_extra(body, extra)
    }

    /// JSON form. `exception` is only included on request.
    pub fn to_value(&self, include_exception: bool) -> Value {
        let mut map = Map::new();
        map.insert("body".into(), self.body.clone());
        map.insert("extra".into(), self.extra.to_value());
        if include_exception {
            let exception = self
                .exception
                .as_ref()
                .map(|e| Value::String(e.trace().to_string()))
                .unwrap_or(Value::Null);
            map.insert("exception".into(), exception);
        }
        Value::Object(map)
    }

    pub fn to_wire_form(&self, include_exception: bool) -> Vec<u8> {
        self.to_value(include_exception).to_string().into_bytes()
    }

    /// Records a failure and bumps `failure_count` exactly once.
    /// Drop signals are not failures and leave the message untouched.
    pub fn set_exception(&mut self, error: StepError) {
        if let Some(captured) = CapturedError::capture(error) {
            self.exception = Some(captured);
            self.extra.record_failure();
        }
    }

    pub fn exception(&self) -> Option<&CapturedError> {
        self.exception.as_ref()
    }

    pub fn failed(&self) -> bool {
        self.exception.is_some()
    }

    pub fn failure_count(&self) -> u32 {
        self.extra.failure_count()
    }

    /// Replaces `body`, `extra` and/or `config`. Unknown keys are ignored.
    pub fn replace(&mut self, fields: Map<String, Value>) -> Result<&mut Self, MessageError> {
        for (key, value) in fields {
            match key.as_str() {
                "body" => self.body = value,
                "extra" => {
                    self.extra = serde_json::from_value(value).map_err(MessageError::InvalidExtra)?
                }
                "config" => self.config = Some(value),
                _ => {}
            }
        }
        Ok(self)
    }

    pub fn raw(&self) -> Option<&RawDelivery> {
        self.raw.as_ref()
    }

    pub fn set_raw(&mut self, raw: RawDelivery) {
        self.raw = Some(raw);
    }

    pub fn delivery_tag(&self) -> Option<u64> {
        self.raw.as_ref().and_then(|raw| raw.tag)
    }

    pub fn broker(&self) -> Option<&Arc<dyn Broker>> {
        self.broker.as_ref()
    }

    pub fn bind_broker(&mut self, broker: Arc<dyn Broker>) {
        self.broker = Some(broker);
    }

    /// Acknowledges the delivery, running the broker's confirm hooks around it.
    /// No-op when no broker is bound.
    pub async fn confirm(&mut self) -> Result<(), BrokerError> {
        let Some(broker) = self.broker.clone() else {
            return Ok(());
        };
        let ctx = HookContext::for_broker(broker.name());
        if let Err(signal) = broker
            .middlewares()
            .emit(Phase::BeforeConfirm, &ctx, self)
            .await
        {
            warn!(broker = %broker.name(), task_id = %self.extra.task_id(), %signal, "before_confirm hook failed");
        }
        broker.confirm(self).await?;
        if let Err(signal) = broker
            .middlewares()
            .emit(Phase::AfterConfirm, &ctx, self)
            .await
        {
            warn!(broker = %broker.name(), task_id = %self.extra.task_id(), %signal, "after_confirm hook failed");
        }
        Ok(())
    }

    /// Negative acknowledgement without redelivery.
    pub async fn reject(&self) -> Result<(), BrokerError> {
        match &self.broker {
            Some(broker) => broker.reject(self).await,
            None => Ok(()),
        }
    }

    /// Redelivers through the bound broker.
    ///
    /// `is_source = true` republishes the bytes exactly as received;
    /// `false` republishes the current body and extra.
    pub async fn requeue(&self, is_source: bool) -> Result<(), BrokerError> {
        match &self.broker {
            Some(broker) => broker.requeue(self, is_source).await,
            None => Ok(()),
        }
    }
}

fn is_envelope(map: &Map<String, Value>) -> bool {
    map.contains_key("body") && matches!(map.get("extra"), Some(Value::Object(_)))
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("body", &self.body)
            .field("extra", &self.extra)
            .field("config", &self.config)
            .field("exception", &self.exception.as_ref().map(|e| e.trace()))
            .field("broker", &self.broker.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

impl From<Value> for Message {
    fn from(body: Value) -> Self {
        Self::new(body)
    }
}
