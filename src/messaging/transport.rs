//! Seam between the retry machinery and a partitioned log.
//!
//! A transport offers three things:
//! - a consumer-group session that hands out one sequential feed per
//!   assigned partition
//! - a publisher that emits a single message to a named topic and waits
//!   for the broker's confirmation
//! - offset commits once a message has been fully resolved

use std::sync::Arc;

use async_trait::async_trait;

/// A message pulled from one partition of the source topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
    pub payload: Arc<[u8]>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Joins `group` and subscribes to `topic`.
    async fn subscribe(&self, group: &str, topic: &str)
    -> Result<Box<dyn Session>, TransportError>;

    /// Acquires a publisher bound to `topic`. Callers must `finish` it.
    async fn publisher(&self, topic: &str) -> Result<Box<dyn Publisher>, TransportError>;
}

pub enum SessionEvent {
    Assigned(Box<dyn PartitionFeed>),
    Revoked { partition: i32 },
}

#[async_trait]
pub trait Session: Send {
    /// Next assignment change. `None` once the session is closed.
    async fn next_event(&mut self) -> Option<SessionEvent>;
}

#[async_trait]
pub trait PartitionFeed: Send {
    fn partition(&self) -> i32;

    /// Next message in partition order. `None` once the feed is exhausted.
    async fn next(&mut self) -> Option<Delivery>;

    /// Marks `delivery` as processed so the group resumes after it.
    fn commit(&self, delivery: &Delivery) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Publisher: Send {
    /// Emits one message and waits until the broker confirms or rejects it.
    async fn emit_sync(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Releases the publisher's transport resources.
    async fn finish(self: Box<Self>);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to establish consumer session: {0}")]
    SessionFailed(String),

    #[error("Failed to create publisher: {0}")]
    PublisherFailed(String),

    #[error("Failed to emit message: {0}")]
    EmitFailed(String),

    #[error("Failed to commit offset: {0}")]
    CommitFailed(String),
}
