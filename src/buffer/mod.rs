//! The Segment Buffer abstraction.
//!
//! The Buffer is treated as a black box at the protocol level: a sharded
//! key-value store holding partial segments keyed by trace identifier. This
//! module defines the trait the Worker and Stage consume plus two concrete
//! bindings — an in-memory double for tests, and a Redis-backed
//! implementation for production.

mod redis_backend;

pub use redis_backend::RedisSegmentBuffer;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// An opaque, already-serialized span. The Flusher never inspects its
/// contents, only its presence.
pub type SpanPayload = Vec<u8>;

/// A completed segment: an ordered group of spans sharing a trace
/// identifier, ready to be emitted as one downstream message.
#[derive(Debug, Clone)]
pub struct FlushedSegment {
    pub spans: Vec<SpanPayload>,
}

impl FlushedSegment {
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Memory usage for one shard, as reported by the Buffer.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    pub used: u64,
    pub available: u64,
}

/// Segment keys are opaque strings (trace identifiers in practice).
pub type SegmentKey = String;

#[async_trait]
pub trait SegmentBuffer: Send + Sync {
    /// Drains up to `max_segments` ready segments per assigned shard, where
    /// "ready" is defined relative to `now` (producer-drift-adjusted wall
    /// clock seconds).
    async fn flush_segments(
        &self,
        max_segments: usize,
        now: i64,
    ) -> Result<HashMap<SegmentKey, FlushedSegment>>;

    /// Acknowledges an entire batch, removing the keys from the Buffer.
    async fn done_flush_segments(&self, keys: &[SegmentKey]) -> Result<()>;

    /// Per-shard (used, available) memory figures.
    async fn get_memory_info(&self) -> Result<Vec<MemoryInfo>>;

    /// The fixed subset of shards this Buffer handle is responsible for.
    fn assigned_shards(&self) -> &[u32];

    /// Observational side effect; records the current stored-segment count
    /// for dashboards. Never changes Buffer state visible to flush_segments.
    async fn record_stored_segments(&self) -> Result<()>;
}

/// A single stored segment plus the wall-clock second at which it becomes
/// eligible for flushing.
#[derive(Debug, Clone)]
struct StoredSegment {
    segment: FlushedSegment,
    ready_at: i64,
}

/// Deterministic, in-process Buffer double. Every shard lives in the same
/// map; shard boundaries only affect `assigned_shards().len()` and thus the
/// soft-backpressure threshold `max_segments * assigned_shards().len()`.
pub struct InMemorySegmentBuffer {
    shards: Vec<u32>,
    segments: Arc<RwLock<HashMap<SegmentKey, StoredSegment>>>,
}

impl InMemorySegmentBuffer {
    pub fn new(shards: Vec<u32>) -> Self {
        Self {
            shards,
            segments: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Test helper: inserts a segment ready to flush immediately.
    pub fn insert_ready(&self, key: impl Into<String>, spans: Vec<SpanPayload>) {
        self.insert_ready_at(key, spans, i64::MIN);
    }

    pub fn insert_ready_at(&self, key: impl Into<String>, spans: Vec<SpanPayload>, ready_at: i64) {
        self.segments.write().insert(
            key.into(),
            StoredSegment {
                segment: FlushedSegment { spans },
                ready_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }
}

#[async_trait]
impl SegmentBuffer for InMemorySegmentBuffer {
    async fn flush_segments(
        &self,
        max_segments: usize,
        now: i64,
    ) -> Result<HashMap<SegmentKey, FlushedSegment>> {
        let mut segments = self.segments.write();
        let ready_keys: Vec<SegmentKey> = segments
            .iter()
            .filter(|(_, stored)| stored.ready_at <= now)
            .map(|(key, _)| key.clone())
            .take(max_segments)
            .collect();

        let mut result = HashMap::with_capacity(ready_keys.len());
        for key in ready_keys {
            if let Some(stored) = segments.get(&key) {
                result.insert(key, stored.segment.clone());
            }
        }
        Ok(result)
    }

    async fn done_flush_segments(&self, keys: &[SegmentKey]) -> Result<()> {
        let mut segments = self.segments.write();
        for key in keys {
            segments.remove(key);
        }
        Ok(())
    }

    async fn get_memory_info(&self) -> Result<Vec<MemoryInfo>> {
        Ok(self
            .shards
            .iter()
            .map(|_| MemoryInfo {
                used: 0,
                available: 1,
            })
            .collect())
    }

    fn assigned_shards(&self) -> &[u32] {
        &self.shards
    }

    async fn record_stored_segments(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flush_respects_max_segments() {
        let buffer = InMemorySegmentBuffer::new(vec![0]);
        buffer.insert_ready("k1", vec![b"a".to_vec()]);
        buffer.insert_ready("k2", vec![b"b".to_vec()]);
        buffer.insert_ready("k3", vec![b"c".to_vec()]);

        let result = buffer.flush_segments(2, 0).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_respects_readiness() {
        let buffer = InMemorySegmentBuffer::new(vec![0]);
        buffer.insert_ready_at("future", vec![b"a".to_vec()], 1_000_000);

        let result = buffer.flush_segments(10, 0).await.unwrap();
        assert!(result.is_empty());

        let result = buffer.flush_segments(10, 1_000_000).await.unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn test_done_flush_segments_removes_keys() {
        let buffer = InMemorySegmentBuffer::new(vec![0]);
        buffer.insert_ready("k1", vec![b"a".to_vec()]);
        assert_eq!(buffer.len(), 1);

        buffer
            .done_flush_segments(&["k1".to_string()])
            .await
            .unwrap();
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_empty_segment_is_preserved_until_acknowledged() {
        let buffer = InMemorySegmentBuffer::new(vec![0]);
        buffer.insert_ready("empty", vec![]);

        let result = buffer.flush_segments(10, 0).await.unwrap();
        assert_eq!(result.len(), 1);
        assert!(result["empty"].is_empty());

        buffer
            .done_flush_segments(&["empty".to_string()])
            .await
            .unwrap();
        assert!(buffer.is_empty());
    }
}
