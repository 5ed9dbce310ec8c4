use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{Consumer, DefaultConsumerContext, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset};
use tracing::{debug, error, info, warn};

use super::transport::{
    Delivery, PartitionFeed, Publisher, Session, SessionEvent, Transport, TransportError,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const ASSIGNMENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Kafka transport on top of librdkafka.
///
/// Consumer settings:
/// - `enable.auto.commit=true` with `enable.auto.offset.store=false`: only
///   offsets stored through [`PartitionFeed::commit`] get committed
/// - `auto.offset.reset=earliest`: a new group starts from the beginning
/// - one split queue per assigned partition, so partitions progress
///   independently of each other
#[derive(Debug, Clone)]
pub struct KafkaTransport {
    brokers: Vec<String>,
    client_id: String,
}

impl KafkaTransport {
    pub fn new(brokers: Vec<String>, client_id: impl Into<String>) -> Self {
        Self {
            brokers,
            client_id: client_id.into(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("client.id", &self.client_id);
        config
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn subscribe(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<Box<dyn Session>, TransportError> {
        info!(brokers = ?self.brokers, group, topic, "Creating Kafka consumer");

        let consumer: StreamConsumer = self
            .client_config()
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .create()
            .map_err(|e| {
                error!(error = %e, "Failed to create Kafka consumer");
                TransportError::SessionFailed(e.to_string())
            })?;

        consumer.subscribe(&[topic]).map_err(|e| {
            error!(error = %e, topic, "Failed to subscribe to Kafka topic");
            TransportError::SessionFailed(e.to_string())
        })?;

        let consumer = Arc::new(consumer);

        // Consumers connect lazily; fetching metadata proves a broker answers.
        let probe = consumer.clone();
        let probe_topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(Some(probe_topic.as_str()), Timeout::After(METADATA_TIMEOUT))
                .map(|_| ())
        })
        .await
        .map_err(|e| TransportError::SessionFailed(e.to_string()))?
        .map_err(|e| {
            error!(error = %e, brokers = ?self.brokers, "No Kafka broker reachable");
            TransportError::SessionFailed(e.to_string())
        })?;

        info!(group, topic, "Kafka consumer subscribed");

        Ok(Box::new(KafkaSession {
            consumer,
            topic: topic.to_string(),
            assigned: HashSet::new(),
            pending: VecDeque::new(),
            poll: tokio::time::interval(ASSIGNMENT_POLL_INTERVAL),
        }))
    }

    async fn publisher(&self, topic: &str) -> Result<Box<dyn Publisher>, TransportError> {
        let producer: FutureProducer = self
            .client_config()
            .set("acks", "all")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| {
                error!(error = %e, topic, "Failed to create Kafka producer");
                TransportError::PublisherFailed(e.to_string())
            })?;

        Ok(Box::new(KafkaPublisher {
            producer,
            topic: topic.to_string(),
        }))
    }
}

struct KafkaSession {
    consumer: Arc<StreamConsumer>,
    topic: String,
    assigned: HashSet<i32>,
    pending: VecDeque<SessionEvent>,
    poll: tokio::time::Interval,
}

impl KafkaSession {
    /// Diffs the group assignment against the partitions already handed out.
    fn reconcile(&mut self) {
        let assignment = match self.consumer.assignment() {
            Ok(assignment) => assignment,
            Err(e) => {
                warn!(error = %e, "Failed to read partition assignment");
                return;
            }
        };
        let current: HashSet<i32> = assignment
            .elements_for_topic(&self.topic)
            .iter()
            .map(|element| element.partition())
            .collect();

        let revoked: Vec<i32> = self.assigned.difference(&current).copied().collect();
        for partition in revoked {
            self.assigned.remove(&partition);
            self.pending.push_back(SessionEvent::Revoked { partition });
        }

        let added: Vec<i32> = current.difference(&self.assigned).copied().collect();
        for partition in added {
            let Some(queue) = self.consumer.split_partition_queue(&self.topic, partition) else {
                warn!(partition, "Failed to split partition queue, retrying on next poll");
                continue;
            };
            self.assigned.insert(partition);
            self.pending.push_back(SessionEvent::Assigned(Box::new(KafkaPartitionFeed {
                consumer: self.consumer.clone(),
                queue,
                topic: self.topic.clone(),
                partition,
            })));
        }
    }

    /// A message reached the main queue before its partition was split off.
    /// Seeking back makes it show up again on the partition's own queue.
    fn rewind(&self, partition: i32, offset: i64) {
        debug!(partition, offset, "Rewinding message delivered on main queue");
        if let Err(e) = self
            .consumer
            .seek(&self.topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
        {
            error!(error = %e, partition, offset, "Failed to rewind partition");
        }
    }
}

#[async_trait]
impl Session for KafkaSession {
    async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            // The main queue has to be polled for rebalances to happen.
            let stray = tokio::select! {
                _ = self.poll.tick() => None,
                message = self.consumer.recv() => match message {
                    Ok(message) => Some((message.partition(), message.offset())),
                    Err(e) => {
                        warn!(error = %e, "Kafka consumer error");
                        None
                    }
                },
            };

            self.reconcile();
            if let Some((partition, offset)) = stray {
                self.rewind(partition, offset);
            }
        }
    }
}

struct KafkaPartitionFeed {
    consumer: Arc<StreamConsumer>,
    queue: StreamPartitionQueue<DefaultConsumerContext>,
    topic: String,
    partition: i32,
}

#[async_trait]
impl PartitionFeed for KafkaPartitionFeed {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.queue.recv().await {
                Ok(message) => {
                    return Some(Delivery {
                        partition: message.partition(),
                        offset: message.offset(),
                        payload: Arc::from(message.payload().unwrap_or_default()),
                    });
                }
                Err(e) => warn!(error = %e, partition = self.partition, "Kafka partition error"),
            }
        }
    }

    fn commit(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.consumer
            .store_offset(&self.topic, delivery.partition, delivery.offset + 1)
            .map_err(|e| TransportError::CommitFailed(e.to_string()))
    }
}

struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn emit_sync(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let record = FutureRecord::<(), [u8]>::to(&self.topic).payload(payload);
        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| TransportError::EmitFailed(e.to_string()))
    }

    async fn finish(self: Box<Self>) {
        let KafkaPublisher { producer, topic } = *self;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT)).await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, topic = %topic, "Failed to flush Kafka producer"),
            Err(e) => warn!(error = %e, topic = %topic, "Kafka producer flush task failed"),
        }
    }
}
