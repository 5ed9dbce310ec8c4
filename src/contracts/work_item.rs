use std::sync::Arc;

use tokio::sync::oneshot;

use super::outcome::Outcome;

/// One delivery attempt of a message, handed to application code.
///
/// `ack` and `nack` consume the item, so an attempt can be resolved at most
/// once. Dropping an item without resolving it counts as a nack. Holding it
/// forever stalls the partition it came from.
pub struct WorkItem {
    payload: Arc<[u8]>,
    attempt: u32,
    completion: oneshot::Sender<Outcome>,
}

impl WorkItem {
    /// Creates an item together with the receiver its outcome arrives on.
    pub fn new(payload: Arc<[u8]>, attempt: u32) -> (Self, oneshot::Receiver<Outcome>) {
        let (completion, outcome) = oneshot::channel();
        (
            Self {
                payload,
                attempt,
                completion,
            },
            outcome,
        )
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Zero-based delivery attempt this item belongs to.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ack(self) {
        self.resolve(Outcome::Ack);
    }

    pub fn nack(self) {
        self.resolve(Outcome::Nack);
    }

    pub fn resolve(self, outcome: Outcome) {
        // The machine only stops listening when the receiver is being torn down.
        let _ = self.completion.send(outcome);
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("payload_size", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish()
    }
}
