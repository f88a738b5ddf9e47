//! NATS-backed Sink, matching the message-bus stack already used elsewhere
//! in the codebase.

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::error;

use super::{CompletionHandle, Sink};
use crate::error::Result;

pub struct NatsSink {
    client: async_nats::Client,
}

impl NatsSink {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| crate::error::FlusherError::PublishRejected(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Sink for NatsSink {
    async fn produce(&self, topic: &str, payload: Vec<u8>) -> Result<CompletionHandle> {
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let subject = topic.to_string();

        tokio::spawn(async move {
            let result = async {
                let ack = client.publish(subject, payload.into()).await?;
                Ok::<_, async_nats::PublishError>(ack)
            }
            .await;

            let outcome = match result {
                Ok(_) => Ok(()),
                Err(e) => {
                    error!(error = %e, "nats publish failed");
                    Err(e.into())
                }
            };
            let _ = tx.send(outcome);
        });

        Ok(CompletionHandle::new(rx))
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| crate::error::FlusherError::PublishRejected(e.to_string()))?;
        Ok(())
    }
}
