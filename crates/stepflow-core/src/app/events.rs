//! Events - ライフサイクルイベントの配信
//!
//! Subscribers get a [`broadcast`] receiver; slow subscribers lag and lose
//! old events rather than blocking the workers.

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Stopped,
    Received,
    Consumed,
    Error,
    Dropped,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepEvent {
    pub kind: EventKind,
    pub group: Option<String>,
    pub step: Option<String>,
    pub broker: Option<String>,
    pub task_id: Option<String>,
    pub detail: Option<String>,
}

impl StepEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            group: None,
            step: None,
            broker: None,
            task_id: None,
            detail: None,
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = Some(broker.into());
        self
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StepEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget. No subscribers is not an error.
    pub fn emit(&self, event: StepEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(StepEvent::new(EventKind::Received).step("s").task_id("t-1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Received);
        assert_eq!(event.step.as_deref(), Some("s"));
        assert_eq!(event.task_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        EventBus::new(4).emit(StepEvent::new(EventKind::Started));
    }
}
