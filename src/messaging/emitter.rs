use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use super::transport::Transport;

/// Destination for messages that exhausted their retries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Publishes `payload` to `topic` and returns once the transport has
    /// confirmed or refused it.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Dead-letter sink backed by a transport publisher.
///
/// Every publish acquires its own publisher and releases it before
/// returning, whatever the outcome of the emit.
pub struct TransportEmitter {
    transport: Arc<dyn Transport>,
}

impl TransportEmitter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl DeadLetterSink for TransportEmitter {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let mut publisher = self.transport.publisher(topic).await.map_err(|e| {
            error!(error = %e, topic, "Failed to create dead-letter publisher");
            PublishError::Unavailable(e.to_string())
        })?;

        let result = publisher.emit_sync(payload).await;
        publisher.finish().await;

        match result {
            Ok(()) => {
                info!(topic, payload_size = payload.len(), "Dead-letter message published");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, topic, "Dead-letter publish rejected");
                Err(PublishError::Rejected(e.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("Dead-letter publisher unavailable: {0}")]
    Unavailable(String),

    #[error("Dead-letter publish rejected: {0}")]
    Rejected(String),
}
