//! Redis-backed Segment Buffer.
//!
//! Segments are stored as Redis hashes keyed `segment:{shard}:{key}`, one
//! field per span (`span:0`, `span:1`, ...). A companion sorted set
//! `ready:{shard}`, scored by ready-timestamp, drives the flush query so a
//! single `ZRANGEBYSCORE` finds everything eligible as of `now`. Memory
//! pressure is read straight off `INFO memory`.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use tracing::{debug, info, warn};

use super::{FlushedSegment, MemoryInfo, SegmentBuffer, SegmentKey, SpanPayload};
use crate::error::Result;

pub struct RedisSegmentBuffer {
    conn: ConnectionManager,
    shards: Vec<u32>,
}

impl RedisSegmentBuffer {
    pub async fn connect(url: &str, shards: Vec<u32>) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(shards = shards.len(), "connected segment buffer to redis");
        Ok(Self { conn, shards })
    }

    fn ready_set_key(shard: u32) -> String {
        format!("ready:{shard}")
    }

    fn segment_hash_key(shard: u32, segment_key: &str) -> String {
        format!("segment:{shard}:{segment_key}")
    }
}

#[async_trait]
impl SegmentBuffer for RedisSegmentBuffer {
    async fn flush_segments(
        &self,
        max_segments: usize,
        now: i64,
    ) -> Result<HashMap<SegmentKey, FlushedSegment>> {
        let mut conn = self.conn.clone();
        let mut result = HashMap::new();

        for &shard in &self.shards {
            let ready_set = Self::ready_set_key(shard);
            let keys: Vec<String> = conn
                .zrangebyscore_limit(&ready_set, 0, now, 0, max_segments as isize)
                .await?;

            for segment_key in keys {
                let hash_key = Self::segment_hash_key(shard, &segment_key);
                let fields: HashMap<String, Vec<u8>> = conn.hgetall(&hash_key).await?;

                let mut spans: Vec<(usize, SpanPayload)> = fields
                    .into_iter()
                    .filter_map(|(field, value)| {
                        field
                            .strip_prefix("span:")
                            .and_then(|idx| idx.parse::<usize>().ok())
                            .map(|idx| (idx, value))
                    })
                    .collect();
                spans.sort_by_key(|(idx, _)| *idx);

                result.insert(
                    segment_key,
                    FlushedSegment {
                        spans: spans.into_iter().map(|(_, payload)| payload).collect(),
                    },
                );
            }
        }

        Ok(result)
    }

    async fn done_flush_segments(&self, keys: &[SegmentKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();

        for &shard in &self.shards {
            let ready_set = Self::ready_set_key(shard);
            for key in keys {
                pipe.zrem(&ready_set, key).ignore();
                pipe.del(Self::segment_hash_key(shard, key)).ignore();
            }
        }

        let _: RedisResult<()> = pipe.query_async(&mut conn).await;
        debug!(count = keys.len(), "acknowledged flushed segments");
        Ok(())
    }

    async fn get_memory_info(&self) -> Result<Vec<MemoryInfo>> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await?;

        let used = parse_info_field(&info, "used_memory").unwrap_or(0);
        let maxmemory = parse_info_field(&info, "maxmemory").unwrap_or(0);

        if maxmemory == 0 {
            warn!("redis maxmemory is unset; hard backpressure check is inert");
        }

        // The real per-shard breakdown isn't exposed by Redis; the whole
        // instance's memory figures are attributed evenly across this
        // Worker's assigned shards so the Stage's `used/available` totals
        // still reflect the single underlying instance.
        let shard_count = self.shards.len().max(1) as u64;
        Ok(self
            .shards
            .iter()
            .map(|_| MemoryInfo {
                used: used / shard_count,
                available: maxmemory / shard_count,
            })
            .collect())
    }

    fn assigned_shards(&self) -> &[u32] {
        &self.shards
    }

    async fn record_stored_segments(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut total = 0i64;
        for &shard in &self.shards {
            let count: i64 = conn.zcard(Self::ready_set_key(shard)).await?;
            total += count;
        }
        crate::metrics::set_stored_segments(total);
        Ok(())
    }
}

fn parse_info_field(info: &str, field: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.strip_prefix(&format!("{field}:")))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info_field() {
        let info = "# Memory\r\nused_memory:104857600\r\nmaxmemory:1073741824\r\n";
        assert_eq!(parse_info_field(info, "used_memory"), Some(104857600));
        assert_eq!(parse_info_field(info, "maxmemory"), Some(1073741824));
        assert_eq!(parse_info_field(info, "missing"), None);
    }
}
