//! Body-hash deduplication.

use async_trait::async_trait;
use dashmap::DashSet;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::Message;
use crate::ports::{HookContext, HookResult, HookSignal, Middleware};

/// Remembers which body hashes were already processed.
#[async_trait]
pub trait SeenStore: Send + Sync {
    async fn has_seen(&self, hash: &str) -> bool;
    async fn mark_seen(&self, hash: &str);
}

#[derive(Debug, Default)]
pub struct MemorySeenStore {
    seen: DashSet<String>,
}

impl MemorySeenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[async_trait]
impl SeenStore for MemorySeenStore {
    async fn has_seen(&self, hash: &str) -> bool {
        self.seen.contains(hash)
    }

    async fn mark_seen(&self, hash: &str) {
        self.seen.insert(hash.to_string());
    }
}

/// SHA-256 hex of the body. Strings hash their raw text, everything else
/// its compact JSON form.
pub fn body_hash(body: &Value) -> String {
    let mut hasher = Sha256::new();
    match body {
        Value::String(text) => hasher.update(text.as_bytes()),
        other => hasher.update(other.to_string().as_bytes()),
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Drops messages whose body hash was already seen.
///
/// A hash is recorded after a successful consume only, so failed messages
/// can come back.
pub struct UniqueMiddleware<S = MemorySeenStore> {
    store: S,
}

impl UniqueMiddleware<MemorySeenStore> {
    pub fn in_memory() -> Self {
        Self::new(MemorySeenStore::new())
    }
}

impl<S: SeenStore> UniqueMiddleware<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: SeenStore + 'static> Middleware for UniqueMiddleware<S> {
    fn name(&self) -> &str {
        "unique"
    }

    async fn before_consume(&self, _ctx: &HookContext, message: &mut Message) -> HookResult {
        let hash = body_hash(&message.body);
        if self.store.has_seen(&hash).await {
            return Err(HookSignal::drop_message(format!(
                "message <{}> has been seen before",
                message.extra.task_id()
            )));
        }
        Ok(())
    }

    async fn after_consume(&self, _ctx: &HookContext, message: &mut Message) -> HookResult {
        if message.failed() || message.body.is_null() {
            return Ok(());
        }
        self.store.mark_seen(&body_hash(&message.body)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::StepError;

    #[test]
    fn hash_is_stable_hex() {
        let a = body_hash(&json!({"id": 1}));
        assert_eq!(a.len(), 64);
        assert_eq!(a, body_hash(&json!({"id": 1})));
        assert_ne!(a, body_hash(&json!({"id": 2})));
        // 文字列は JSON 引用符なしでハッシュする
        assert_eq!(
            body_hash(&json!("abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn second_identical_body_is_dropped() {
        let unique = UniqueMiddleware::in_memory();
        let ctx = HookContext::for_step("s");

        let mut first = Message::new(json!({"id": 1}));
        unique.before_consume(&ctx, &mut first).await.unwrap();
        unique.after_consume(&ctx, &mut first).await.unwrap();

        let mut second = Message::new(json!({"id": 1}));
        let result = unique.before_consume(&ctx, &mut second).await;
        assert!(matches!(result, Err(HookSignal::Drop(_))));
    }

    #[tokio::test]
    async fn failed_and_null_bodies_are_not_recorded() {
        let unique = UniqueMiddleware::in_memory();
        let ctx = HookContext::for_step("s");

        let mut failed = Message::new(json!({"id": 1}));
        failed.set_exception(StepError::msg("boom"));
        unique.after_consume(&ctx, &mut failed).await.unwrap();

        let mut empty = Message::new(Value::Null);
        unique.after_consume(&ctx, &mut empty).await.unwrap();

        assert!(unique.store().is_empty());
    }
}
