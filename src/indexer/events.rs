//! Query completion notifications
//!
//! One event is emitted per queried backend once the query settles,
//! describing what was sent and what came back.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::SearchMode;

/// One outbound request made for a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub url: String,
    /// HTTP status, absent when the request never got a response
    pub status: Option<u16>,
    pub elapsed_ms: u64,
    pub release_count: usize,
}

/// Outcome of one backend's part in a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexerQueryEvent {
    pub query_id: Uuid,
    pub indexer_id: i32,
    pub indexer_name: String,
    pub mode: SearchMode,
    pub term: Option<String>,
    pub categories: Vec<i32>,
    pub requests: Vec<RequestRecord>,
    pub successful: bool,
    /// The query was cancelled before this backend finished
    pub cancelled: bool,
    pub release_count: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Receives completion events
pub trait EventSink: Send + Sync {
    fn publish(&self, event: IndexerQueryEvent);
}

/// Writes events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: IndexerQueryEvent) {
        if event.successful {
            info!(
                query_id = %event.query_id,
                indexer_id = event.indexer_id,
                indexer_name = %event.indexer_name,
                mode = %event.mode,
                requests = event.requests.len(),
                releases = event.release_count,
                elapsed_ms = event.elapsed_ms,
                "Indexer query completed"
            );
        } else {
            warn!(
                query_id = %event.query_id,
                indexer_id = event.indexer_id,
                indexer_name = %event.indexer_name,
                mode = %event.mode,
                cancelled = event.cancelled,
                error = ?event.error,
                elapsed_ms = event.elapsed_ms,
                "Indexer query did not complete"
            );
        }
    }
}

/// Fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<IndexerQueryEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexerQueryEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: IndexerQueryEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(successful: bool) -> IndexerQueryEvent {
        IndexerQueryEvent {
            query_id: Uuid::new_v4(),
            indexer_id: 1,
            indexer_name: "Test".to_string(),
            mode: SearchMode::Search,
            term: Some("matrix".to_string()),
            categories: vec![2000],
            requests: vec![],
            successful,
            cancelled: false,
            release_count: 0,
            elapsed_ms: 12,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();

        let sent = event(true);
        sink.publish(sent.clone());

        assert_eq!(rx.recv().await.unwrap(), sent);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let sink = BroadcastEventSink::new(1);
        sink.publish(event(false));
        TracingEventSink.publish(event(false));
    }
}
