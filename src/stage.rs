//! The Flusher Stage: the in-pipeline adapter exposing the five canonical
//! stage operations while managing the Worker's lifecycle, clock and
//! backpressure.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::buffer::SegmentBuffer;
use crate::error::{FlusherError, RejectReason, Result};
use crate::metrics;
use crate::shared::{wall_clock_seconds, SharedState};
use crate::sink::Sink;
use crate::worker::{FlusherWorker, TaskWorkerHandle, ThreadWorkerHandle, WorkerHandle};

/// Message payload the Stage's upstream channel carries: either an
/// already-routed passthrough sentinel, or a producer-side clock tick.
#[derive(Debug, Clone, Copy)]
pub enum FlusherPayload {
    Filtered,
    Tick(i64),
}

#[derive(Debug, Clone)]
pub struct Message {
    pub payload: FlusherPayload,
}

impl Message {
    pub fn filtered() -> Self {
        Self {
            payload: FlusherPayload::Filtered,
        }
    }

    pub fn tick(producer_ts: i64) -> Self {
        Self {
            payload: FlusherPayload::Tick(producer_ts),
        }
    }
}

/// The five canonical stage operations. The Flusher Stage both implements
/// this trait (to the upstream stage) and forwards every call through it
/// to the opaque next stage.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    async fn poll(&self) -> Result<()>;
    async fn submit(&self, message: Message) -> Result<()>;
    async fn terminate(&self);
    async fn close(&self);
    async fn join(&self, timeout: Option<Duration>);
}

/// Constructs a fresh, unspawned Worker bound to the current shared state;
/// invoked both at Stage construction and on every restart.
type WorkerFactory = Arc<dyn Fn(SharedState) -> FlusherWorker + Send + Sync>;

/// Spawns a constructed Worker behind whichever isolation boundary the
/// deployment chose (OS thread in production, cooperative task in tests).
type WorkerSpawner = Arc<dyn Fn(FlusherWorker) -> Box<dyn WorkerHandle> + Send + Sync>;

pub struct FlusherStage {
    next: Arc<dyn PipelineStage>,
    buffer: Arc<dyn SegmentBuffer>,
    shared: SharedState,
    worker_factory: WorkerFactory,
    spawner: WorkerSpawner,
    worker: Mutex<Box<dyn WorkerHandle>>,
    restart_count: AtomicU32,
    max_process_restarts: u32,
    max_memory_percentage: f64,
    redis_was_full: AtomicBool,
    join_poll_interval: Duration,
}

impl FlusherStage {
    /// Production configuration: the Worker runs on a dedicated OS thread.
    pub fn new_thread_isolated(
        next: Arc<dyn PipelineStage>,
        buffer: Arc<dyn SegmentBuffer>,
        sink: Arc<dyn Sink>,
        topic: String,
        max_flush_segments: usize,
        max_memory_percentage: f64,
        max_process_restarts: u32,
        idle_sleep: Duration,
        join_poll_interval: Duration,
    ) -> Self {
        Self::new(
            next,
            buffer,
            sink,
            topic,
            max_flush_segments,
            max_memory_percentage,
            max_process_restarts,
            idle_sleep,
            join_poll_interval,
            Arc::new(ThreadWorkerHandle::spawn) as WorkerSpawner,
        )
    }

    /// Test/cooperative configuration: the Worker runs as a plain Tokio
    /// task sharing the caller's publish callback in-process.
    pub fn new_cooperative(
        next: Arc<dyn PipelineStage>,
        buffer: Arc<dyn SegmentBuffer>,
        sink: Arc<dyn Sink>,
        topic: String,
        max_flush_segments: usize,
        max_memory_percentage: f64,
        max_process_restarts: u32,
        idle_sleep: Duration,
        join_poll_interval: Duration,
    ) -> Self {
        Self::new(
            next,
            buffer,
            sink,
            topic,
            max_flush_segments,
            max_memory_percentage,
            max_process_restarts,
            idle_sleep,
            join_poll_interval,
            Arc::new(|worker| Box::new(TaskWorkerHandle::spawn(worker)) as Box<dyn WorkerHandle>),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        next: Arc<dyn PipelineStage>,
        buffer: Arc<dyn SegmentBuffer>,
        sink: Arc<dyn Sink>,
        topic: String,
        max_flush_segments: usize,
        max_memory_percentage: f64,
        max_process_restarts: u32,
        idle_sleep: Duration,
        join_poll_interval: Duration,
        spawner: WorkerSpawner,
    ) -> Self {
        let shared = SharedState::new();

        let worker_factory: WorkerFactory = {
            let buffer = buffer.clone();
            let sink = sink.clone();
            let topic = topic.clone();
            Arc::new(move |shared: SharedState| {
                FlusherWorker::new(
                    buffer.clone(),
                    sink.clone(),
                    topic.clone(),
                    shared,
                    max_flush_segments,
                    idle_sleep,
                )
            })
        };

        let initial_worker = spawner(worker_factory(shared.clone()));

        Self {
            next,
            buffer,
            shared,
            worker_factory,
            spawner,
            worker: Mutex::new(initial_worker),
            restart_count: AtomicU32::new(0),
            max_process_restarts,
            max_memory_percentage,
            redis_was_full: AtomicBool::new(false),
            join_poll_interval,
        }
    }

    fn restart_worker(&self) {
        let fresh = (self.worker_factory)(self.shared.clone());
        let handle = (self.spawner)(fresh);
        *self.worker.lock() = handle;
    }

    fn memory_check_enabled(&self) -> bool {
        self.max_memory_percentage < 1.0
    }

    /// Exposes the Stage's shared-primitive bundle so callers (tests,
    /// diagnostics) can observe drift/backpressure/stop-flag state directly
    /// instead of inferring it from `submit`'s return value alone.
    pub fn shared_state(&self) -> SharedState {
        self.shared.clone()
    }
}

#[async_trait]
impl PipelineStage for FlusherStage {
    async fn poll(&self) -> Result<()> {
        self.next.poll().await
    }

    async fn submit(&self, message: Message) -> Result<()> {
        // submit is not a hot path: message payloads map to batches of
        // spans, at a handful per second. poll() may be called more often.
        let is_alive = self.worker.lock().is_alive();
        if !is_alive {
            metrics::record_flusher_dead();
            let restarts = self.restart_count.load(Ordering::SeqCst);
            if restarts < self.max_process_restarts {
                self.restart_worker();
                self.restart_count.fetch_add(1, Ordering::SeqCst);
            } else {
                return Err(FlusherError::WorkerExhausted {
                    max_restarts: self.max_process_restarts,
                });
            }
        }

        if let Err(e) = self.buffer.record_stored_segments().await {
            warn!(error = %e, "failed to record stored segment count");
        }

        // Pause insertion if the flusher isn't making progress fast enough.
        // Backpressure is never reported as an error, only as a metric.
        if self.shared.backpressure.is_set() {
            metrics::record_backpressure();
            return Err(FlusherError::Rejected {
                reason: RejectReason::SoftBackpressure,
            });
        }

        // Drift is set before the memory check: if the buffer stays full
        // for a long time, drift grows negative and flushing pauses too.
        if let FlusherPayload::Tick(producer_ts) = message.payload {
            let drift = producer_ts - wall_clock_seconds();
            self.shared.drift.set(drift);
            metrics::record_drift_seconds(drift);
        }

        if self.memory_check_enabled() {
            let memory_infos = self.buffer.get_memory_info().await?;
            let used: u64 = memory_infos.iter().map(|m| m.used).sum();
            let available: u64 = memory_infos.iter().map(|m| m.available).sum();

            if available > 0 && (used as f64 / available as f64) > self.max_memory_percentage {
                if !self.redis_was_full.load(Ordering::SeqCst) {
                    error!("pausing consumer due to segment buffer being full");
                }
                metrics::record_hard_backpressure();
                self.redis_was_full.store(true, Ordering::SeqCst);
                return Err(FlusherError::Rejected {
                    reason: RejectReason::HardBackpressure,
                });
            }
        }

        self.redis_was_full.store(false, Ordering::SeqCst);
        self.next.submit(message).await
    }

    async fn terminate(&self) {
        self.shared.stop_flag.set();
        self.next.terminate().await;
    }

    async fn close(&self) {
        self.shared.stop_flag.set();
        self.next.close().await;
    }

    async fn join(&self, timeout: Option<Duration>) {
        // Set stopped first so the worker drains while next_step also
        // shuts down — intentional parallel shutdown.
        self.shared.stop_flag.set();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);

        self.next.join(timeout).await;

        loop {
            let alive = self.worker.lock().is_alive();
            if !alive {
                break;
            }
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    break;
                }
            }
            tokio::time::sleep(self.join_poll_interval).await;
        }

        let still_alive = self.worker.lock().is_alive();
        if still_alive {
            self.worker.lock().terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InMemorySegmentBuffer;
    use crate::sink::ChannelSink;

    /// A terminal next-stage double that just records what it was called
    /// with, matching the "opaque downstream processing stage" of §2.
    #[derive(Default)]
    struct RecordingNextStage {
        submitted: Mutex<Vec<FlusherPayload>>,
    }

    #[async_trait]
    impl PipelineStage for RecordingNextStage {
        async fn poll(&self) -> Result<()> {
            Ok(())
        }

        async fn submit(&self, message: Message) -> Result<()> {
            self.submitted.lock().push(message.payload);
            Ok(())
        }

        async fn terminate(&self) {}
        async fn close(&self) {}
        async fn join(&self, _timeout: Option<Duration>) {}
    }

    fn test_stage(
        buffer: Arc<InMemorySegmentBuffer>,
        sink: Arc<ChannelSink>,
        next: Arc<RecordingNextStage>,
    ) -> FlusherStage {
        FlusherStage::new_cooperative(
            next,
            buffer,
            sink,
            "topic".to_string(),
            2,
            1.0,
            10,
            Duration::from_millis(5),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_submit_forwards_when_healthy() {
        let buffer = Arc::new(InMemorySegmentBuffer::new(vec![0]));
        let (sink, _rx) = ChannelSink::new();
        let next = Arc::new(RecordingNextStage::default());
        let stage = test_stage(buffer, Arc::new(sink), next.clone());

        stage.submit(Message::filtered()).await.unwrap();
        assert_eq!(next.submitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_rejects_without_forwarding() {
        let buffer = Arc::new(InMemorySegmentBuffer::new(vec![0]));
        let (sink, _rx) = ChannelSink::new();
        let next = Arc::new(RecordingNextStage::default());
        let stage = test_stage(buffer, Arc::new(sink), next.clone());

        stage.shared.backpressure.set(true);
        let result = stage.submit(Message::filtered()).await;

        assert!(matches!(
            result,
            Err(FlusherError::Rejected {
                reason: RejectReason::SoftBackpressure
            })
        ));
        assert!(next.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tick_updates_drift() {
        let buffer = Arc::new(InMemorySegmentBuffer::new(vec![0]));
        let (sink, _rx) = ChannelSink::new();
        let next = Arc::new(RecordingNextStage::default());
        let stage = test_stage(buffer, Arc::new(sink), next);

        let now = wall_clock_seconds();
        stage.submit(Message::tick(now - 100)).await.unwrap();
        assert_eq!(stage.shared.drift.get(), -100);
    }

    #[tokio::test]
    async fn test_memory_pressure_rejects_and_sticky_flag_clears_on_recovery() {
        struct FakeMemoryBuffer {
            inner: InMemorySegmentBuffer,
            used: std::sync::atomic::AtomicU64,
            available: u64,
        }

        #[async_trait]
        impl SegmentBuffer for FakeMemoryBuffer {
            async fn flush_segments(
                &self,
                max: usize,
                now: i64,
            ) -> Result<std::collections::HashMap<String, crate::buffer::FlushedSegment>>
            {
                self.inner.flush_segments(max, now).await
            }
            async fn done_flush_segments(&self, keys: &[String]) -> Result<()> {
                self.inner.done_flush_segments(keys).await
            }
            async fn get_memory_info(&self) -> Result<Vec<crate::buffer::MemoryInfo>> {
                Ok(vec![crate::buffer::MemoryInfo {
                    used: self.used.load(Ordering::SeqCst),
                    available: self.available,
                }])
            }
            fn assigned_shards(&self) -> &[u32] {
                self.inner.assigned_shards()
            }
            async fn record_stored_segments(&self) -> Result<()> {
                Ok(())
            }
        }

        let buffer = Arc::new(FakeMemoryBuffer {
            inner: InMemorySegmentBuffer::new(vec![0]),
            used: std::sync::atomic::AtomicU64::new(9),
            available: 10,
        });
        let (sink, _rx) = ChannelSink::new();
        let next = Arc::new(RecordingNextStage::default());

        let stage = FlusherStage::new_cooperative(
            next.clone(),
            buffer.clone(),
            Arc::new(sink),
            "topic".to_string(),
            2,
            0.8,
            10,
            Duration::from_millis(5),
            Duration::from_millis(5),
        );

        let result = stage.submit(Message::filtered()).await;
        assert!(matches!(
            result,
            Err(FlusherError::Rejected {
                reason: RejectReason::HardBackpressure
            })
        ));
        assert!(stage.redis_was_full.load(Ordering::SeqCst));

        buffer.used.store(5, Ordering::SeqCst);
        stage.submit(Message::filtered()).await.unwrap();
        assert!(!stage.redis_was_full.load(Ordering::SeqCst));
        assert_eq!(next.submitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_join_sets_stop_flag_and_waits_for_worker() {
        let buffer = Arc::new(InMemorySegmentBuffer::new(vec![0]));
        let (sink, _rx) = ChannelSink::new();
        let next = Arc::new(RecordingNextStage::default());
        let stage = test_stage(buffer, Arc::new(sink), next);

        stage.join(Some(Duration::from_secs(5))).await;
        assert!(stage.shared.stop_flag.is_set());
        assert!(!stage.worker.lock().is_alive());
    }

    #[tokio::test]
    async fn test_worker_exhaustion_is_fatal() {
        let buffer = Arc::new(InMemorySegmentBuffer::new(vec![0]));
        let (sink, _rx) = ChannelSink::new();
        let next = Arc::new(RecordingNextStage::default());

        let stage = FlusherStage::new_cooperative(
            next,
            buffer,
            Arc::new(sink),
            "topic".to_string(),
            2,
            1.0,
            0,
            Duration::from_millis(5),
            Duration::from_millis(5),
        );

        // max_process_restarts = 0: the worker starts alive, so force a
        // dead observation by aborting it directly before the first submit.
        stage.worker.lock().terminate().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = stage.submit(Message::filtered()).await;
        assert!(matches!(result, Err(FlusherError::WorkerExhausted { .. })));
    }
}
