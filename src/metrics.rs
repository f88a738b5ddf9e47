//! Prometheus metrics for the Span Segment Flusher.
//!
//! Counters: flusher_dead, backpressure (soft), hard_backpressure,
//! empty_segments. Timers: segment_size_bytes, drift.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram, IntCounter,
    IntGauge, TextEncoder,
};
use tracing::error;

static FLUSHER_DEAD: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "flusher_dead_total",
        "Number of times submit observed the worker not alive"
    )
    .expect("failed to create flusher_dead metric")
});

static BACKPRESSURE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "flusher_backpressure_total",
        "Number of submits rejected due to soft backpressure"
    )
    .expect("failed to create backpressure metric")
});

static HARD_BACKPRESSURE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "flusher_hard_backpressure_total",
        "Number of submits rejected due to buffer memory pressure"
    )
    .expect("failed to create hard_backpressure metric")
});

static EMPTY_SEGMENTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "flusher_empty_segments_total",
        "Number of zero-span segments observed and skipped"
    )
    .expect("failed to create empty_segments metric")
});

static SEGMENT_SIZE_BYTES: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "flusher_segment_size_bytes",
        "Size of each published segment payload in bytes",
        vec![
            64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0
        ]
    )
    .expect("failed to create segment_size_bytes metric")
});

static DRIFT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "flusher_drift_seconds",
        "Observed producer/local clock drift in seconds",
        vec![-300.0, -60.0, -10.0, -1.0, 0.0, 1.0, 10.0, 60.0, 300.0]
    )
    .expect("failed to create drift metric")
});

static STORED_SEGMENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "flusher_stored_segments",
        "Segments currently stored in the buffer, as of the last observation"
    )
    .expect("failed to create stored_segments metric")
});

pub fn record_flusher_dead() {
    FLUSHER_DEAD.inc();
}

pub fn record_backpressure() {
    BACKPRESSURE.inc();
}

pub fn record_hard_backpressure() {
    HARD_BACKPRESSURE.inc();
}

pub fn record_empty_segment() {
    EMPTY_SEGMENTS.inc();
}

pub fn record_segment_size_bytes(bytes: usize) {
    SEGMENT_SIZE_BYTES.observe(bytes as f64);
}

pub fn record_drift_seconds(drift: i64) {
    DRIFT_SECONDS.observe(drift as f64);
}

pub fn set_stored_segments(count: i64) {
    STORED_SEGMENTS.set(count);
}

/// Collects all metrics as Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

// ============================================
// METRICS SERVER
// ============================================

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

async fn handle_metrics(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(Response::new(Full::new(Bytes::from(gather_metrics()))))
}

/// Starts the metrics HTTP server. Runs until cancelled by the caller.
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                error!(error = %e, "error serving metrics connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        record_flusher_dead();
        record_backpressure();
        record_hard_backpressure();
        record_empty_segment();
        record_segment_size_bytes(1024);
        record_drift_seconds(-5);
        set_stored_segments(42);

        let metrics = gather_metrics();
        assert!(metrics.contains("flusher_dead_total"));
        assert!(metrics.contains("flusher_backpressure_total"));
        assert!(metrics.contains("flusher_hard_backpressure_total"));
        assert!(metrics.contains("flusher_empty_segments_total"));
        assert!(metrics.contains("flusher_segment_size_bytes"));
        assert!(metrics.contains("flusher_drift_seconds"));
        assert!(metrics.contains("flusher_stored_segments"));
    }
}
