//! Error types for the Span Segment Flusher

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlusherError {
    #[error("segment buffer error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("sink publish error: {0}")]
    NatsError(#[from] async_nats::PublishError),

    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The Stage's soft- or hard-backpressure retry signal. Never logged as a
    /// fault; callers translate this into whatever "retry later" mechanism
    /// their upstream stage exposes.
    #[error("retry later: {reason}")]
    Rejected { reason: RejectReason },

    /// Submit observed the Worker dead with the restart budget spent.
    #[error("flusher worker exhausted {max_restarts} restarts; see observability for the original cause")]
    WorkerExhausted { max_restarts: u32 },

    /// A completion handle failed; the Worker iteration that produced it is
    /// aborted and the Worker is considered dead by its supervising Stage.
    #[error("sink did not accept publish: {0}")]
    PublishRejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SoftBackpressure,
    HardBackpressure,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::SoftBackpressure => write!(f, "soft backpressure"),
            RejectReason::HardBackpressure => write!(f, "hard backpressure"),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlusherError>;
