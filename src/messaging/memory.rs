//! In-process transport for tests and local runs.
//!
//! - Topics are partitioned append-only logs held in memory
//! - Every subscriber gets every partition of the topic assigned
//! - Publishes, session setup and publisher creation can be made to fail

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::transport::{
    Delivery, PartitionFeed, Publisher, Session, SessionEvent, Transport, TransportError,
};

#[derive(Default)]
struct State {
    logs: HashMap<String, Vec<Vec<Arc<[u8]>>>>,
    published: HashMap<String, Vec<Vec<u8>>>,
    committed: HashMap<(String, i32), i64>,
    failing_topics: HashSet<String>,
    refuse_sessions: bool,
    refuse_publishers: bool,
    open_publishers: usize,
    sessions: Vec<mpsc::UnboundedSender<SessionEvent>>,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declares `topic` with `partitions` partitions. Existing logs are kept.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.state();
        let logs = state.logs.entry(topic.to_string()).or_default();
        if logs.len() < partitions {
            logs.resize_with(partitions, Vec::new);
        }
    }

    /// Appends a message to one partition of the source topic and returns
    /// its offset.
    pub fn produce(&self, topic: &str, partition: i32, payload: &[u8]) -> i64 {
        let offset = {
            let mut state = self.state();
            let logs = state.logs.entry(topic.to_string()).or_default();
            let index = partition.max(0) as usize;
            if logs.len() <= index {
                logs.resize_with(index + 1, Vec::new);
            }
            logs[index].push(Arc::from(payload));
            logs[index].len() as i64 - 1
        };
        self.appended.notify_waiters();
        offset
    }

    /// Messages emitted through publishers to `topic`, in emit order.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state().published.get(topic).cloned().unwrap_or_default()
    }

    /// Next offset the group resumes from on `partition`, if any was committed.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    pub fn open_publishers(&self) -> usize {
        self.state().open_publishers
    }

    pub fn fail_publishes(&self, topic: &str) {
        self.state().failing_topics.insert(topic.to_string());
    }

    pub fn refuse_sessions(&self, refuse: bool) {
        self.state().refuse_sessions = refuse;
    }

    pub fn refuse_publishers(&self, refuse: bool) {
        self.state().refuse_publishers = refuse;
    }

    /// Takes `partition` away from every open session.
    pub fn revoke(&self, partition: i32) {
        let mut state = self.state();
        state
            .sessions
            .retain(|tx| tx.send(SessionEvent::Revoked { partition }).is_ok());
    }

    /// Ends every session and feed, as a broker going away would.
    pub fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.sessions.clear();
        }
        self.appended.notify_waiters();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(
        &self,
        _group: &str,
        topic: &str,
    ) -> Result<Box<dyn Session>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        if state.refuse_sessions || state.closed {
            return Err(TransportError::SessionFailed(
                "no reachable broker".to_string(),
            ));
        }

        let logs = state.logs.entry(topic.to_string()).or_default();
        if logs.is_empty() {
            logs.push(Vec::new());
        }
        let partitions = logs.len() as i32;

        for partition in 0..partitions {
            let position = state
                .committed
                .get(&(topic.to_string(), partition))
                .copied()
                .unwrap_or(0);
            let feed = MemoryFeed {
                transport: self.clone(),
                topic: topic.to_string(),
                partition,
                position,
            };
            // Receiver is held locally, the send cannot fail.
            let _ = tx.send(SessionEvent::Assigned(Box::new(feed)));
        }
        state.sessions.push(tx);

        Ok(Box::new(MemorySession { events: rx }))
    }

    async fn publisher(&self, topic: &str) -> Result<Box<dyn Publisher>, TransportError> {
        let mut state = self.state();
        if state.refuse_publishers {
            return Err(TransportError::PublisherFailed(
                "no reachable broker".to_string(),
            ));
        }
        state.open_publishers += 1;
        Ok(Box::new(MemoryPublisher {
            transport: self.clone(),
            topic: topic.to_string(),
        }))
    }
}

struct MemorySession {
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
impl Session for MemorySession {
    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }
}

struct MemoryFeed {
    transport: MemoryTransport,
    topic: String,
    partition: i32,
    position: i64,
}

impl MemoryFeed {
    fn poll_log(&self) -> Result<Option<Arc<[u8]>>, ()> {
        let state = self.transport.state();
        if state.closed {
            return Err(());
        }
        Ok(state
            .logs
            .get(&self.topic)
            .and_then(|logs| logs.get(self.partition as usize))
            .and_then(|log| log.get(self.position as usize))
            .cloned())
    }
}

#[async_trait]
impl PartitionFeed for MemoryFeed {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let appended = self.transport.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            match self.poll_log() {
                Err(()) => return None,
                Ok(Some(payload)) => {
                    let delivery = Delivery {
                        partition: self.partition,
                        offset: self.position,
                        payload,
                    };
                    self.position += 1;
                    return Some(delivery);
                }
                Ok(None) => appended.await,
            }
        }
    }

    fn commit(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.transport
            .state()
            .committed
            .insert((self.topic.clone(), delivery.partition), delivery.offset + 1);
        Ok(())
    }
}

struct MemoryPublisher {
    transport: MemoryTransport,
    topic: String,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn emit_sync(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.transport.state();
        if state.failing_topics.contains(&self.topic) {
            return Err(TransportError::EmitFailed(format!(
                "topic {} rejected the message",
                self.topic
            )));
        }
        state
            .published
            .entry(self.topic.clone())
            .or_default()
            .push(payload.to_vec());
        Ok(())
    }

    async fn finish(self: Box<Self>) {
        let mut state = self.transport.state();
        state.open_publishers = state.open_publishers.saturating_sub(1);
    }
}
