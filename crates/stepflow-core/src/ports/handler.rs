//! Step functions and error callbacks.

use std::future::Future;
use std::mem;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Message, StepError};

/// What a step function produces. Every non-empty item is sent to the
/// step's destination brokers.
#[derive(Debug, Default)]
pub enum StepOutput {
    #[default]
    Nothing,
    /// Wrapped into a fresh message.
    Value(Value),
    /// Forwarded as-is, keeping its extra.
    Message(Message),
    Batch(Vec<StepOutput>),
}

impl StepOutput {
    /// Flattens nested batches into messages, in order.
    pub fn into_messages(self) -> Vec<Message> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(self, out: &mut Vec<Message>) {
        match self {
            Self::Nothing => {}
            Self::Value(value) => out.push(Message::new(value)),
            Self::Message(message) => out.push(message),
            Self::Batch(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
        }
    }
}

impl From<()> for StepOutput {
    fn from(_: ()) -> Self {
        Self::Nothing
    }
}

impl From<Value> for StepOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Message> for StepOutput {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<Option<Value>> for StepOutput {
    fn from(value: Option<Value>) -> Self {
        value.map(Self::Value).unwrap_or_default()
    }
}

impl From<Vec<Value>> for StepOutput {
    fn from(values: Vec<Value>) -> Self {
        Self::Batch(values.into_iter().map(Self::Value).collect())
    }
}

pub type StepResult = Result<StepOutput, StepError>;

/// The user step function.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, message: &mut Message) -> StepResult;
}

/// Synchronous closure handler with direct access to the message.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(&mut Message) -> StepResult + Send + Sync + 'static,
{
    async fn handle(&self, message: &mut Message) -> StepResult {
        (self.0)(message)
    }
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Message) -> StepResult + Send + Sync + 'static,
{
    FnHandler(f)
}

/// Async closure handler. The closure owns the message while it runs and
/// hands it back with the result; the returned message replaces the
/// original, so body and extra edits survive into `requeue(false)`.
pub struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for AsyncFnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (Message, StepResult)> + Send + 'static,
{
    async fn handle(&self, message: &mut Message) -> StepResult {
        let owned = mem::replace(message, Message::new(Value::Null));
        let (returned, result) = (self.0)(owned).await;
        *message = returned;
        result
    }
}

pub fn async_handler_fn<F, Fut>(f: F) -> AsyncFnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (Message, StepResult)> + Send + 'static,
{
    AsyncFnHandler(f)
}

/// Invoked once when a message ends with `EndWithCallback`.
#[async_trait]
pub trait ErrorCallback: Send + Sync {
    async fn on_error(&self, message: &Message);
}

#[async_trait]
impl<F> ErrorCallback for F
where
    F: Fn(&Message) + Send + Sync,
{
    async fn on_error(&self, message: &Message) {
        self(message)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn batches_flatten_in_order() {
        let output = StepOutput::Batch(vec![
            StepOutput::Value(json!(1)),
            StepOutput::Nothing,
            StepOutput::from(vec![json!(2), json!(3)]),
        ]);
        let bodies: Vec<Value> = output.into_messages().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn forwarded_messages_keep_their_extra() {
        let original = Message::new(json!("x"));
        let task_id = original.extra.task_id().to_string();
        let messages = StepOutput::from(original).into_messages();
        assert_eq!(messages[0].extra.task_id(), task_id);
    }

    #[tokio::test]
    async fn fn_handler_sees_the_message() {
        let handler = handler_fn(|message: &mut Message| {
            message.body = json!("seen");
            Ok(StepOutput::from(json!({"ok": true})))
        });
        let mut message = Message::new(json!(null));
        let output = handler.handle(&mut message).await.unwrap();

        assert_eq!(message.body, json!("seen"));
        assert!(matches!(output, StepOutput::Value(_)));
    }

    #[tokio::test]
    async fn async_handler_runs_the_future() {
        let handler = async_handler_fn(|message: Message| async move {
            if message.body == json!("bad") {
                return (message, Err(StepError::msg("bad body")));
            }
            (message, Ok(StepOutput::Nothing))
        });

        assert!(handler.handle(&mut Message::new(json!("good"))).await.is_ok());
        assert!(handler.handle(&mut Message::new(json!("bad"))).await.is_err());
    }

    #[tokio::test]
    async fn async_handler_edits_reach_the_caller() {
        let handler = async_handler_fn(|mut message: Message| async move {
            message.body = json!({"progress": 1});
            message.extra.set("stage", json!("fetched"));
            (message, Err(StepError::retry_queue("later")))
        });
        let mut message = Message::new(json!({"progress": 0}));
        let task_id = message.extra.task_id().to_string();

        assert!(handler.handle(&mut message).await.is_err());
        assert_eq!(message.body, json!({"progress": 1}));
        assert_eq!(message.extra.get("stage"), Some(&json!("fetched")));
        assert_eq!(message.extra.task_id(), task_id);
    }
}
