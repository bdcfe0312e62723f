//! Live stream fan-out
//!
//! Each session registers one stream id. Transcoded chunks go into a bounded
//! broadcast channel; HTTP listeners that fall behind skip chunks instead of
//! growing a buffer.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct StreamHub {
    streams: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl StreamHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register `stream_id`, or attach to it if it already exists
    pub fn register(&self, stream_id: &str) -> LivePublisher {
        let tx = self
            .streams
            .entry(stream_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        LivePublisher {
            stream_id: stream_id.to_string(),
            tx,
        }
    }

    /// Listen to a registered stream
    pub fn subscribe(&self, stream_id: &str) -> Option<broadcast::Receiver<Bytes>> {
        self.streams.get(stream_id).map(|tx| tx.subscribe())
    }

    /// Unregister a stream; its listeners see the end of the stream once
    /// every publisher is gone
    pub fn remove(&self, stream_id: &str) -> bool {
        self.streams.remove(stream_id).is_some()
    }

    /// Unregister the stream `publisher` writes to, unless the id has since
    /// been taken over by another publisher's channel
    pub fn unregister(&self, publisher: &LivePublisher) -> bool {
        self.streams
            .remove_if(&publisher.stream_id, |_, tx| tx.same_channel(&publisher.tx))
            .is_some()
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.streams.contains_key(stream_id)
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.streams.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }
}

/// Write side of one live stream
#[derive(Clone)]
pub struct LivePublisher {
    stream_id: String,
    tx: broadcast::Sender<Bytes>,
}

impl LivePublisher {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Send a chunk; returns how many listeners received it
    pub fn publish(&self, chunk: Bytes) -> usize {
        self.tx.send(chunk).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
