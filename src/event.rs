//! Lifecycle notifications for the streaming pipeline and the coordinator
//!
//! Components publish [`PipelineEvent`]s through a cloneable [`EventEmitter`]
//! backed by a tokio broadcast channel. Publishing never blocks; subscribers
//! that fall behind lose the oldest events.

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    Map(HashMap<String, serde_json::Value>),
}

/// Pipeline event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Event key (e.g., "stream.ranking.updated", "dispatch.bucket.sent")
    pub key: EventKey,

    pub payload: EventPayload,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl PipelineEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Empty)
    }

    /// Create an event with a map payload
    pub fn with_map(key: impl Into<String>, map: HashMap<String, serde_json::Value>) -> Self {
        Self::new(key, EventPayload::Map(map))
    }

    /// Look up a field of a map payload
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        match &self.payload {
            EventPayload::Map(map) => map.get(name),
            EventPayload::Empty => None,
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<PipelineEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event; dropped silently when nobody is subscribed
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to filtered events as an `EventStream` (implements `Stream`)
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&PipelineEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt as TokioStreamExt;
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|r: Result<PipelineEvent, _>| r.ok())
            .filter(move |e| filter(e));
        EventStream {
            inner: Box::pin(stream),
        }
    }

    /// Subscribe to all events as an `EventStream`
    pub fn subscribe_stream(&self) -> EventStream {
        self.subscribe_filtered(|_| true)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Event stream, implements `futures_core::Stream<Item = PipelineEvent>`.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = PipelineEvent> + Send>>,
}

impl Stream for EventStream {
    type Item = PipelineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        use tokio_stream::StreamExt;
        self.next().await
    }
}

/// Event catalog
pub mod events {
    // Streaming mode
    pub const STREAM_EVENT_INGESTED: &str = "stream.event.ingested";
    pub const STREAM_RANKING_UPDATED: &str = "stream.ranking.updated";
    pub const STREAM_COMPLETED: &str = "stream.completed";

    // Distributed mode, coordinator side
    pub const DISPATCH_BUCKET_SENT: &str = "dispatch.bucket.sent";
    pub const DISPATCH_COMPLETED: &str = "dispatch.completed";
    pub const COLLECT_REPORT_RECEIVED: &str = "collect.report.received";
    pub const COLLECT_COMPLETED: &str = "collect.completed";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pipeline_event_empty() {
        let event = PipelineEvent::empty(events::STREAM_COMPLETED);
        assert_eq!(event.key, "stream.completed");
        assert!(matches!(event.payload, EventPayload::Empty));
        assert!(event.field("anything").is_none());
    }

    #[test]
    fn test_pipeline_event_with_map() {
        let event = PipelineEvent::with_map(
            events::DISPATCH_BUCKET_SENT,
            HashMap::from([
                ("hour".to_string(), serde_json::json!(8)),
                ("target".to_string(), serde_json::json!(1)),
            ]),
        );
        assert_eq!(event.field("hour"), Some(&serde_json::json!(8)));
        assert_eq!(event.field("target"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_pipeline_event_timestamp() {
        let before = chrono::Utc::now();
        let event = PipelineEvent::empty("test.event");
        let after = chrono::Utc::now();
        assert!(event.timestamp >= before && event.timestamp <= after);
    }

    #[tokio::test]
    async fn test_emitter_without_subscribers_does_not_fail() {
        let emitter = EventEmitter::new(4);
        for _ in 0..10 {
            emitter.emit(PipelineEvent::empty("nobody.listens"));
        }
    }

    #[tokio::test]
    async fn test_emitter_multiple_subscribers() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(PipelineEvent::empty(events::COLLECT_COMPLETED));

        assert_eq!(rx1.recv().await.unwrap().key, events::COLLECT_COMPLETED);
        assert_eq!(rx2.recv().await.unwrap().key, events::COLLECT_COMPLETED);
    }

    #[tokio::test]
    async fn test_event_stream_filtered() {
        let emitter = EventEmitter::new(16);
        let mut stream = emitter.subscribe_filtered(|e| e.key.starts_with("dispatch."));

        emitter.emit(PipelineEvent::empty(events::STREAM_COMPLETED));
        emitter.emit(PipelineEvent::empty(events::DISPATCH_BUCKET_SENT));
        emitter.emit(PipelineEvent::empty(events::COLLECT_COMPLETED));
        emitter.emit(PipelineEvent::empty(events::DISPATCH_COMPLETED));

        let first = tokio::time::timeout(Duration::from_millis(200), stream.recv())
            .await
            .expect("Timeout")
            .expect("Stream ended");
        let second = tokio::time::timeout(Duration::from_millis(200), stream.recv())
            .await
            .expect("Timeout")
            .expect("Stream ended");
        assert_eq!(first.key, events::DISPATCH_BUCKET_SENT);
        assert_eq!(second.key, events::DISPATCH_COMPLETED);
    }

    #[test]
    fn test_pipeline_event_serialization() {
        let event = PipelineEvent::with_map(
            events::STREAM_RANKING_UPDATED,
            HashMap::from([("events".to_string(), serde_json::json!(3))]),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("stream.ranking.updated"));
        assert!(json.contains("timestamp"));

        let parsed: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.key, events::STREAM_RANKING_UPDATED);
        assert_eq!(parsed.field("events"), Some(&serde_json::json!(3)));
    }
}
