use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, info_span, warn, Instrument};

use super::emitter::{DeadLetterSink, TransportEmitter};
use super::transport::{PartitionFeed, Session, SessionEvent, Transport, TransportError};
use crate::contracts::WorkItem;
use crate::metrics::Metrics;
use crate::retry::{RetryMachine, RetryPolicy};
use crate::shutdown::{self, ShutdownHandle, ShutdownSignal};

const DEAD_LETTER_SUFFIX: &str = ".errors";

/// What happens to in-flight messages when the receiver is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Stop immediately. Messages waiting on an outcome or a backoff are
    /// dropped uncommitted and come back after a restart.
    #[default]
    Abandon,
    /// Let every partition finish the message it holds, retries included,
    /// for at most `timeout`. Whatever is still running then is abandoned.
    Drain { timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub group: String,
    pub topic: String,
    pub policy: RetryPolicy,
    pub shutdown: ShutdownMode,
}

impl ReceiverConfig {
    pub fn new(group: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            topic: topic.into(),
            policy: RetryPolicy::default(),
            shutdown: ShutdownMode::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownMode) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn dead_letter_topic(&self) -> String {
        format!("{}{}", self.topic, DEAD_LETTER_SUFFIX)
    }
}

/// Reads one topic through a consumer group and feeds its messages to the
/// application as work items.
pub struct QueueReceiver {
    transport: Arc<dyn Transport>,
    config: ReceiverConfig,
    dead_letter: Arc<dyn DeadLetterSink>,
    metrics: Option<Arc<Metrics>>,
}

impl QueueReceiver {
    pub fn new(transport: Arc<dyn Transport>, config: ReceiverConfig) -> Self {
        let dead_letter = Arc::new(TransportEmitter::new(transport.clone()));
        Self {
            transport,
            config,
            dead_letter,
            metrics: None,
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Opens the consumer session and starts dispatching in the background.
    ///
    /// Returns as soon as the session exists. Work items are sent on
    /// `outbound`; the returned handle is the only way to stop the receiver.
    pub async fn connect(
        &self,
        outbound: mpsc::Sender<WorkItem>,
    ) -> Result<ReceiverHandle, ConnectError> {
        let dead_letter_topic = self.config.dead_letter_topic();
        info!(
            group = %self.config.group,
            topic = %self.config.topic,
            dead_letter_topic = %dead_letter_topic,
            max_attempts = self.config.policy.max_attempts,
            shutdown_mode = ?self.config.shutdown,
            "Connecting receiver"
        );

        let session = self
            .transport
            .subscribe(&self.config.group, &self.config.topic)
            .await
            .map_err(|e| {
                error!(error = %e, topic = %self.config.topic, "Failed to establish consumer session");
                ConnectError::Session(e)
            })?;

        let mut machine = RetryMachine::new(
            outbound,
            self.dead_letter.clone(),
            dead_letter_topic,
            self.config.policy.clone(),
        );
        if let Some(metrics) = &self.metrics {
            machine = machine.with_metrics(metrics.clone());
        }

        let (trigger, signal) = shutdown::new_pair();
        let run_loop = RunLoop {
            session,
            machine: Arc::new(machine),
            mode: self.config.shutdown,
            signal,
            metrics: self.metrics.clone(),
        };
        let run_loop = tokio::spawn(
            run_loop
                .run()
                .instrument(info_span!("receiver", topic = %self.config.topic)),
        );

        info!(topic = %self.config.topic, "Receiver connected");
        Ok(ReceiverHandle {
            trigger,
            run_loop: Some(run_loop),
        })
    }
}

/// Proof of a running receiver. Dropping it stops dispatch as well.
pub struct ReceiverHandle {
    trigger: ShutdownHandle,
    run_loop: Option<JoinHandle<()>>,
}

impl ReceiverHandle {
    /// Resolves once the run loop has stopped, either because the session
    /// ended or after [`Self::shutdown`].
    pub async fn done(&mut self) -> Result<(), ReceiverError> {
        let Some(run_loop) = self.run_loop.as_mut() else {
            return Ok(());
        };
        let result = run_loop.await;
        self.run_loop = None;

        result.map_err(|e| {
            error!(error = %e, "Receiver run loop failed");
            ReceiverError::RunLoopFailed(e.to_string())
        })
    }

    /// Stops taking new messages and waits for the run loop to wind down
    /// according to the configured [`ShutdownMode`].
    pub async fn shutdown(mut self) -> Result<(), ReceiverError> {
        info!("Shutting down receiver");
        self.trigger.trigger();
        self.done().await
    }
}

struct RunLoop {
    session: Box<dyn Session>,
    machine: Arc<RetryMachine>,
    mode: ShutdownMode,
    signal: ShutdownSignal,
    metrics: Option<Arc<Metrics>>,
}

impl RunLoop {
    async fn run(mut self) {
        let mut workers: JoinSet<(i32, u64)> = JoinSet::new();
        let mut assigned: HashMap<i32, (u64, ShutdownHandle)> = HashMap::new();
        let mut generation: u64 = 0;

        loop {
            tokio::select! {
                _ = self.signal.wait() => {
                    info!("Shutdown signal received, stopping dispatch");
                    break;
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok((partition, ended)) => {
                            if assigned.get(&partition).is_some_and(|(current, _)| *current == ended) {
                                assigned.remove(&partition);
                            }
                        }
                        Err(e) => error!(error = %e, "Partition worker failed"),
                    }
                }

                event = self.session.next_event() => {
                    match event {
                        Some(SessionEvent::Assigned(feed)) => {
                            generation += 1;
                            let partition = feed.partition();
                            let (revoke, revoked) = shutdown::new_pair();
                            if let Some((_, previous)) = assigned.insert(partition, (generation, revoke)) {
                                previous.trigger();
                            }

                            info!(partition, "Partition assigned");
                            let worker = PartitionWorker {
                                feed,
                                machine: self.machine.clone(),
                                stopping: self.signal.clone(),
                                revoked,
                                metrics: self.metrics.clone(),
                            };
                            workers.spawn(
                                async move {
                                    worker.run().await;
                                    (partition, generation)
                                }
                                .instrument(info_span!("partition", partition)),
                            );
                        }
                        Some(SessionEvent::Revoked { partition }) => {
                            info!(partition, "Partition revoked");
                            if let Some((_, revoke)) = assigned.remove(&partition) {
                                revoke.trigger();
                            }
                        }
                        None => {
                            warn!("Consumer session ended");
                            break;
                        }
                    }
                }
            }
        }

        for (_, (_, revoke)) in assigned.drain() {
            revoke.trigger();
        }

        match self.mode {
            ShutdownMode::Abandon => {
                if !workers.is_empty() {
                    warn!(partitions = workers.len(), "Abandoning in-flight messages");
                }
                workers.shutdown().await;
            }
            ShutdownMode::Drain { timeout } => {
                info!(partitions = workers.len(), timeout_ms = timeout.as_millis() as u64, "Draining in-flight messages");
                let drained = tokio::time::timeout(timeout, async {
                    while workers.join_next().await.is_some() {}
                })
                .await;
                if drained.is_err() {
                    warn!(partitions = workers.len(), "Drain timeout elapsed, abandoning remaining messages");
                    workers.shutdown().await;
                }
            }
        }

        info!("Receiver stopped");
    }
}

struct PartitionWorker {
    feed: Box<dyn PartitionFeed>,
    machine: Arc<RetryMachine>,
    stopping: ShutdownSignal,
    revoked: ShutdownSignal,
    metrics: Option<Arc<Metrics>>,
}

impl PartitionWorker {
    async fn run(mut self) {
        let _active = ActivePartition::enter(self.metrics.clone());

        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.stopping.wait() => break,
                _ = self.revoked.wait() => break,
                delivery = self.feed.next() => delivery,
            };
            let Some(delivery) = delivery else {
                info!("Partition feed ended");
                break;
            };

            info!(
                offset = delivery.offset,
                payload_size = delivery.payload.len(),
                "Message received"
            );

            let terminal = self.machine.process(delivery.payload.clone()).await;
            if !terminal.is_resolved() {
                warn!(offset = delivery.offset, "Message left unresolved, stopping partition");
                break;
            }

            if let Err(e) = self.feed.commit(&delivery) {
                error!(error = %e, offset = delivery.offset, "Failed to commit offset");
            }
        }

        info!("Partition worker stopped");
    }
}

/// Keeps the active partition gauge right even when a worker is aborted.
struct ActivePartition(Option<Arc<Metrics>>);

impl ActivePartition {
    fn enter(metrics: Option<Arc<Metrics>>) -> Self {
        if let Some(metrics) = &metrics {
            metrics.active_partitions.inc();
        }
        Self(metrics)
    }
}

impl Drop for ActivePartition {
    fn drop(&mut self) {
        if let Some(metrics) = &self.0 {
            metrics.active_partitions.dec();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Failed to connect receiver: {0}")]
    Session(#[from] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("Receiver run loop failed: {0}")]
    RunLoopFailed(String),
}
