//! The Flusher Worker: drains ready segments from the Buffer and publishes
//! them downstream until told to stop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::Error as _;
use serde::Serialize;
use serde_json::value::RawValue;
use tracing::{error, info, instrument, warn};

use crate::buffer::{FlushedSegment, SegmentBuffer};
use crate::metrics;
use crate::shared::{wall_clock_seconds, SharedState};
use crate::sink::Sink;

/// The wire envelope published downstream: `{"spans":[...]}`, field name
/// literal, array order preserving the Buffer-returned order.
#[derive(Serialize)]
struct PublishedEnvelope<'a> {
    spans: Vec<&'a RawValue>,
}

/// Builds the published payload via `serde_json`, matching every other
/// wire encoding in the surrounding codebase. Each span is already a
/// serialized JSON value, so it is wrapped as a `RawValue` rather than
/// re-parsed and re-encoded — the Worker never inspects a span's contents,
/// only its presence and byte boundaries.
pub fn build_payload(segment: &FlushedSegment) -> crate::error::Result<Vec<u8>> {
    let raw_spans: Vec<Box<RawValue>> = segment
        .spans
        .iter()
        .map(|span| {
            let text = std::str::from_utf8(span).map_err(serde_json::Error::custom)?;
            RawValue::from_string(text.to_string())
        })
        .collect::<std::result::Result<_, _>>()?;

    let envelope = PublishedEnvelope {
        spans: raw_spans.iter().map(|raw| raw.as_ref()).collect(),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub struct FlusherWorker {
    buffer: Arc<dyn SegmentBuffer>,
    sink: Arc<dyn Sink>,
    topic: String,
    shared: SharedState,
    max_flush_segments: usize,
    idle_sleep: Duration,
}

impl FlusherWorker {
    pub fn new(
        buffer: Arc<dyn SegmentBuffer>,
        sink: Arc<dyn Sink>,
        topic: String,
        shared: SharedState,
        max_flush_segments: usize,
        idle_sleep: Duration,
    ) -> Self {
        Self {
            buffer,
            sink,
            topic,
            shared,
            max_flush_segments,
            idle_sleep,
        }
    }

    /// Runs the main loop until SharedStopFlag is observed true, or an
    /// unexpected error terminates the Worker early (§4.1 Failure
    /// semantics). Returning from this function is the Worker's only exit
    /// path; the supervising Stage observes that exit via `is_alive`.
    #[instrument(skip_all, fields(component = "flusher"))]
    pub async fn run(&self) {
        loop {
            if self.shared.stop_flag.is_set() {
                break;
            }

            if let Err(e) = self.run_iteration().await {
                error!(error = %e, "flusher worker iteration failed, exiting");
                return;
            }
        }

        if let Err(e) = self.sink.close().await {
            warn!(error = %e, "error closing sink during worker shutdown");
        }
        info!("flusher worker stopped");
    }

    /// Runs a single drain-and-publish cycle: one `flush_segments` call
    /// through to the batched `done_flush_segments` acknowledgement. `run`
    /// calls this in a loop; tests and benchmarks call it directly to
    /// exercise one iteration deterministically.
    pub async fn run_iteration(&self) -> crate::error::Result<()> {
        let now = wall_clock_seconds() + self.shared.drift.get();

        let result = self
            .buffer
            .flush_segments(self.max_flush_segments, now)
            .await?;

        let shard_count = self.buffer.assigned_shards().len().max(1);
        let threshold = self.max_flush_segments * shard_count;
        self.shared.backpressure.set(result.len() >= threshold);

        if result.is_empty() {
            tokio::time::sleep(self.idle_sleep).await;
            return Ok(());
        }

        let mut completions = Vec::with_capacity(result.len());
        let mut ack_keys = Vec::with_capacity(result.len());

        for (key, segment) in &result {
            ack_keys.push(key.clone());

            if segment.is_empty() {
                metrics::record_empty_segment();
                continue;
            }

            let payload = build_payload(segment)?;
            metrics::record_segment_size_bytes(payload.len());

            let handle = self.sink.produce(&self.topic, payload).await?;
            completions.push(handle);
        }

        for handle in completions {
            handle.result().await?;
        }

        self.buffer.done_flush_segments(&ack_keys).await?;
        Ok(())
    }
}

/// Handle to an isolated Worker, owned by the Stage. Exposes exactly the
/// operations the Stage needs to manage the Worker's lifecycle across the
/// chosen isolation boundary.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn is_alive(&self) -> bool;

    /// Best-effort forcible stop, used only if the Worker is still alive
    /// after `join`'s deadline has passed. Implementations that cannot
    /// safely force-kill their isolation boundary (e.g. a plain OS thread)
    /// rely on SharedStopFlag having already been set by the caller.
    async fn terminate(&self);
}

/// Production isolation: the Worker runs on a dedicated OS thread with its
/// own single-threaded Tokio runtime, so a panic inside the Worker surfaces
/// as a joined thread rather than taking down the host process or its
/// runtime.
pub struct ThreadWorkerHandle {
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ThreadWorkerHandle {
    pub fn spawn(worker: FlusherWorker) -> Self {
        let join_handle = std::thread::Builder::new()
            .name("flusher-worker".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build flusher worker runtime");
                runtime.block_on(worker.run());
            })
            .expect("failed to spawn flusher worker thread");

        Self {
            handle: Mutex::new(Some(join_handle)),
        }
    }
}

#[async_trait]
impl WorkerHandle for ThreadWorkerHandle {
    fn is_alive(&self) -> bool {
        match self.handle.lock().as_ref() {
            Some(h) => !h.is_finished(),
            None => false,
        }
    }

    async fn terminate(&self) {
        // An OS thread cannot be safely force-killed from Rust; the caller
        // has already set SharedStopFlag before reaching this point, so
        // the thread observes it at the top of its next loop iteration.
        warn!("forcible terminate requested for thread-isolated worker; relying on stop flag");
    }
}

/// Test/cooperative isolation: the Worker runs as a plain Tokio task on the
/// caller's runtime, sharing a publish callback in-process.
pub struct TaskWorkerHandle {
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TaskWorkerHandle {
    pub fn spawn(worker: FlusherWorker) -> Self {
        let handle = tokio::spawn(async move { worker.run().await });
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl WorkerHandle for TaskWorkerHandle {
    fn is_alive(&self) -> bool {
        match self.handle.lock().as_ref() {
            Some(h) => !h.is_finished(),
            None => false,
        }
    }

    async fn terminate(&self) {
        if let Some(h) = self.handle.lock().as_ref() {
            h.abort();
        }
    }
}
