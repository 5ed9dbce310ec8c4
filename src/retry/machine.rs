use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use crate::contracts::{Outcome, Terminal, WorkItem};
use crate::messaging::emitter::DeadLetterSink;
use crate::metrics::Metrics;

const LOST_PREVIEW_BYTES: usize = 256;

/// Drives one message through delivery, retries and dead-lettering.
///
/// `process` only returns once the message is terminal, which is what keeps
/// a partition strictly sequential: its worker cannot pull the next message
/// before then.
pub struct RetryMachine {
    outbound: mpsc::Sender<WorkItem>,
    dead_letter: Arc<dyn DeadLetterSink>,
    dead_letter_topic: String,
    policy: RetryPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl RetryMachine {
    pub fn new(
        outbound: mpsc::Sender<WorkItem>,
        dead_letter: Arc<dyn DeadLetterSink>,
        dead_letter_topic: String,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            outbound,
            dead_letter,
            dead_letter_topic,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dead_letter_topic(&self) -> &str {
        &self.dead_letter_topic
    }

    pub async fn process(&self, payload: Arc<[u8]>) -> Terminal {
        let start = Instant::now();
        let terminal = self.run(payload).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_terminal(terminal, start.elapsed().as_secs_f64());
        }
        terminal
    }

    async fn run(&self, payload: Arc<[u8]>) -> Terminal {
        let mut attempt: u32 = 0;

        loop {
            let Some(outcome) = self.deliver(&payload, attempt).await else {
                warn!(
                    attempt,
                    payload_size = payload.len(),
                    "Outbound channel closed, abandoning message"
                );
                return Terminal::Abandoned;
            };

            if outcome.is_ack() {
                info!(attempt, "Message processed successfully");
                return Terminal::Succeeded;
            }

            if !self.policy.should_retry(attempt) {
                return self.dead_letter(&payload, attempt).await;
            }

            let delay = self.policy.backoff.delay(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Message nacked, waiting before redelivery"
            );
            tokio::time::sleep(delay).await;

            attempt += 1;
            if let Some(metrics) = &self.metrics {
                metrics.retries_total.inc();
            }
            info!(attempt, max_attempts = self.policy.max_attempts, "Redelivering message");
        }
    }

    /// Hands a fresh work item to the consumer and waits for its outcome.
    /// `None` when nobody is reading the outbound channel anymore.
    async fn deliver(&self, payload: &Arc<[u8]>, attempt: u32) -> Option<Outcome> {
        let (item, outcome) = WorkItem::new(payload.clone(), attempt);
        self.outbound.send(item).await.ok()?;

        if let Some(metrics) = &self.metrics {
            metrics.deliveries_total.inc();
        }

        match outcome.await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!(attempt, "Work item dropped without ack or nack, treating as nack");
                Some(Outcome::Nack)
            }
        }
    }

    async fn dead_letter(&self, payload: &[u8], attempt: u32) -> Terminal {
        warn!(
            attempt,
            max_attempts = self.policy.max_attempts,
            dead_letter_topic = %self.dead_letter_topic,
            "Retries exhausted, moving message to dead-letter topic"
        );

        match self.dead_letter.publish(&self.dead_letter_topic, payload).await {
            Ok(()) => {
                info!(dead_letter_topic = %self.dead_letter_topic, "Message dead-lettered");
                Terminal::DeadLettered
            }
            Err(e) => {
                let preview_len = payload.len().min(LOST_PREVIEW_BYTES);
                error!(
                    error = %e,
                    dead_letter_topic = %self.dead_letter_topic,
                    payload_size = payload.len(),
                    payload_preview = %String::from_utf8_lossy(&payload[..preview_len]),
                    "Dead-letter publish failed, message lost"
                );
                Terminal::Lost
            }
        }
    }
}
