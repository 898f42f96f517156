//! Attaches configuration fetched from a [`ConfigSource`] to each message.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::domain::Message;
use crate::ports::{HookContext, HookResult, Middleware};

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
}

#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    entries: DashMap<String, Value>,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }
}

/// Where the fetched value goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    /// `message.extra["config"]`, travels with the message.
    Durable,
    /// `message.config`, in-process only.
    Transient,
}

type KeyFn = Arc<dyn Fn(&Message) -> Option<String> + Send + Sync>;

enum ConfigKey {
    Fixed(String),
    PerMessage(KeyFn),
}

/// Fetches configuration before consume. A missing entry yields `null`.
pub struct ConfigMiddleware<S = MemoryConfigSource> {
    source: S,
    key: ConfigKey,
    scope: ConfigScope,
}

impl<S: ConfigSource> ConfigMiddleware<S> {
    pub fn new(source: S, key: impl Into<String>, scope: ConfigScope) -> Self {
        Self {
            source,
            key: ConfigKey::Fixed(key.into()),
            scope,
        }
    }

    /// Key derived from the message; `None` attaches `null`.
    pub fn keyed_by<F>(source: S, key: F, scope: ConfigScope) -> Self
    where
        F: Fn(&Message) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            source,
            key: ConfigKey::PerMessage(Arc::new(key)),
            scope,
        }
    }

    pub fn durable(source: S, key: impl Into<String>) -> Self {
        Self::new(source, key, ConfigScope::Durable)
    }

    pub fn transient(source: S, key: impl Into<String>) -> Self {
        Self::new(source, key, ConfigScope::Transient)
    }

    pub fn scope(&self) -> ConfigScope {
        self.scope
    }

    async fn lookup(&self, message: &Message) -> Value {
        let key = match &self.key {
            ConfigKey::Fixed(key) => Some(key.clone()),
            ConfigKey::PerMessage(key_fn) => key_fn(message),
        };
        match key {
            Some(key) => self.source.get(&key).await.unwrap_or(Value::Null),
            None => Value::Null,
        }
    }
}

#[async_trait]
impl<S: ConfigSource + 'static> Middleware for ConfigMiddleware<S> {
    fn name(&self) -> &str {
        "config"
    }

    async fn before_consume(&self, _ctx: &HookContext, message: &mut Message) -> HookResult {
        let value = self.lookup(message).await;
        match self.scope {
            ConfigScope::Durable => {
                message.extra.set("config", value);
            }
            ConfigScope::Transient => message.config = Some(value),
        }
        Ok(())
    }
}
