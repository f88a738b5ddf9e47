//! Span Segment Flusher
//!
//! Background worker embedded inside a stream-processing pipeline that
//! incrementally assembles distributed-tracing segments in an external
//! segment buffer and publishes completed segments to a downstream topic.
//!
//! This binary wires the Flusher Stage to a terminal next-stage (there is
//! no further pipeline hop in this standalone deployment) and drives it
//! from clock ticks plus graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use span_flusher::buffer::{InMemorySegmentBuffer, RedisSegmentBuffer, SegmentBuffer};
use span_flusher::config::Config;
use span_flusher::error;
use span_flusher::metrics;
use span_flusher::shared;
use span_flusher::sink::{self, NatsSink, Sink};
use span_flusher::stage::{FlusherStage, Message, PipelineStage};

/// Span Segment Flusher - drains ready trace segments and publishes them.
#[derive(Parser, Debug)]
#[command(name = "span-flusher")]
#[command(author = "NEURO Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Background worker that drains ready trace segments from a segment buffer and publishes them downstream")]
struct Cli {
    /// Use the in-memory segment buffer and channel sink instead of Redis/NATS.
    #[arg(long, default_value = "false")]
    standalone: bool,

    /// Log level override (trace, debug, info, warn, error). Falls back to
    /// the `LOG_LEVEL` environment variable / configured default when not
    /// passed.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Output logs as JSON. Falls back to the `JSON_LOGS` environment
    /// variable when not passed.
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

/// The terminal next stage in this standalone deployment: there is nothing
/// further downstream, so every call is a no-op forward.
struct TerminalStage;

#[async_trait]
impl PipelineStage for TerminalStage {
    async fn poll(&self) -> error::Result<()> {
        Ok(())
    }

    async fn submit(&self, _message: Message) -> error::Result<()> {
        Ok(())
    }

    async fn terminate(&self) {}
    async fn close(&self) {}
    async fn join(&self, _timeout: Option<Duration>) {}
}

fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Waits for SIGTERM/SIGINT, whichever arrives first.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, initiating graceful shutdown"),
        _ = terminate => info!("received sigterm, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    // CLI flags override the config-derived (env-var driven) logging
    // surface when passed; otherwise the loaded Config's LOG_LEVEL
    // / JSON_LOGS values apply.
    let log_level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    let json_logs = cli.json_logs || config.json_logs;
    setup_logging(&log_level, json_logs);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_flush_segments = config.max_flush_segments,
        max_memory_percentage = config.max_memory_percentage,
        standalone = cli.standalone,
        "starting span segment flusher"
    );

    let shards = config.assigned_shards.clone();

    let buffer: Arc<dyn SegmentBuffer> = if cli.standalone {
        Arc::new(InMemorySegmentBuffer::new(shards))
    } else {
        Arc::new(
            RedisSegmentBuffer::connect(&config.redis_url, shards)
                .await
                .context("failed to connect segment buffer")?,
        )
    };

    let sink: Arc<dyn Sink> = if cli.standalone {
        let (channel_sink, mut rx) = sink::ChannelSink::new();
        tokio::spawn(async move {
            while let Some((topic, payload)) = rx.recv().await {
                info!(topic = %topic, bytes = payload.len(), "standalone sink discarded publish");
            }
        });
        Arc::new(channel_sink)
    } else {
        Arc::new(
            NatsSink::connect(&config.nats_url)
                .await
                .context("failed to connect downstream sink")?,
        )
    };

    let next = Arc::new(TerminalStage);

    let flusher = Arc::new(FlusherStage::new_thread_isolated(
        next,
        buffer,
        sink,
        config.topic.clone(),
        config.max_flush_segments,
        config.max_memory_percentage,
        config.max_process_restarts,
        config.idle_sleep(),
        config.join_poll_interval(),
    ));

    if config.metrics_enabled {
        let addr: SocketAddr = config
            .metrics_bind
            .parse()
            .context("invalid metrics_bind address")?;
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(addr).await {
                error!(error = %e, "metrics server failed");
            }
        });
        info!(address = %config.metrics_bind, "metrics server listening");
    }

    // Drive clock ticks: a real deployment receives producer-timestamp ticks
    // interleaved with real messages on the upstream channel. Standing alone,
    // this binary advances drift toward zero once a second using the local
    // wall clock, which keeps the Worker's clock fresh absent any upstream.
    let tick_flusher = flusher.clone();
    let tick_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let now = shared::wall_clock_seconds();
            match tick_flusher.submit(Message::tick(now)).await {
                Ok(()) => {}
                Err(error::FlusherError::Rejected { reason }) => {
                    info!(%reason, "submit rejected, pipeline applying backpressure upstream");
                }
                Err(e) => {
                    error!(error = %e, "fatal error driving flusher stage");
                    break;
                }
            }
        }
    });

    shutdown_signal().await;

    info!("shutting down flusher stage");
    flusher.join(Some(Duration::from_secs(30))).await;
    tick_handle.abort();

    info!("span segment flusher stopped");
    Ok(())
}
