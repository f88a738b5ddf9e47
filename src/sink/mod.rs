//! The downstream Sink abstraction: a message producer accepting opaque
//! byte payloads on a named topic, returning per-publish completion
//! handles whose resolution gates segment acknowledgement.

mod nats_backend;

pub use nats_backend::NatsSink;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{FlusherError, Result};

/// An opaque future returned by the Sink that resolves when a publish is
/// durably accepted (or fails if the Sink rejects it).
pub struct CompletionHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl CompletionHandle {
    pub fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx }
    }

    /// Resolves once the publish is accepted, or returns the Sink's error.
    pub async fn result(self) -> Result<()> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(FlusherError::PublishRejected(
                "sink dropped completion handle".to_string(),
            )),
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn produce(&self, topic: &str, payload: Vec<u8>) -> Result<CompletionHandle>;

    async fn close(&self) -> Result<()>;
}

/// Test double: every publish is handed to a channel a test can drain, and
/// the completion handle resolves according to an injectable policy so
/// fault-injection scenarios (publish failure, slow publish) are easy to
/// express without a real message bus.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<(String, Vec<u8>)>,
    fail_next: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                tx,
                fail_next: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Causes the next `produce` call's completion handle to resolve with
    /// an error, simulating a transient publish failure (§7, kind 1).
    pub fn fail_next_publish(&self) {
        self.fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn produce(&self, topic: &str, payload: Vec<u8>) -> Result<CompletionHandle> {
        let (tx, rx) = oneshot::channel();
        let should_fail = self
            .fail_next
            .swap(false, std::sync::atomic::Ordering::SeqCst);

        if should_fail {
            let _ = tx.send(Err(FlusherError::PublishRejected(
                "injected test failure".to_string(),
            )));
        } else {
            self.tx
                .send((topic.to_string(), payload))
                .map_err(|e| FlusherError::PublishRejected(e.to_string()))?;
            let _ = tx.send(Ok(()));
        }

        Ok(CompletionHandle::new(rx))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_payload() {
        let (sink, mut rx) = ChannelSink::new();
        let handle = sink.produce("topic", b"payload".to_vec()).await.unwrap();
        handle.result().await.unwrap();

        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "topic");
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn test_channel_sink_injected_failure() {
        let (sink, _rx) = ChannelSink::new();
        sink.fail_next_publish();

        let handle = sink.produce("topic", b"payload".to_vec()).await.unwrap();
        assert!(handle.result().await.is_err());
    }
}
