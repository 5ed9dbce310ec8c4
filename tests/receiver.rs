use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use retrying_receiver::messaging::{ConnectError, MemoryTransport};
use retrying_receiver::metrics::Metrics;
use retrying_receiver::{
    Constant, Outcome, QueueReceiver, ReceiverConfig, ReceiverHandle, RetryPolicy, ShutdownMode,
    WorkItem,
};

const TOPIC: &str = "orders";
const DEAD_LETTERS: &str = "orders.errors";

type Seen = Arc<Mutex<Vec<(Vec<u8>, u32)>>>;

fn config(max_attempts: u32) -> ReceiverConfig {
    ReceiverConfig::new("billing", TOPIC)
        .with_policy(RetryPolicy::new(max_attempts, Constant(Duration::ZERO)))
}

/// Resolves every work item with `decide(payload, attempt)` and records what it saw.
fn spawn_consumer<F>(mut items: mpsc::Receiver<WorkItem>, decide: F) -> (Seen, JoinHandle<()>)
where
    F: Fn(&[u8], u32) -> Outcome + Send + 'static,
{
    let seen: Seen = Arc::default();
    let log = seen.clone();
    let task = tokio::spawn(async move {
        while let Some(item) = items.recv().await {
            log.lock()
                .unwrap()
                .push((item.payload().to_vec(), item.attempt()));
            let outcome = decide(item.payload(), item.attempt());
            item.resolve(outcome);
        }
    });
    (seen, task)
}

async fn start(
    transport: &MemoryTransport,
    config: ReceiverConfig,
    decide: impl Fn(&[u8], u32) -> Outcome + Send + 'static,
) -> (ReceiverHandle, Seen) {
    let (outbound, items) = mpsc::channel(4);
    let (seen, _) = spawn_consumer(items, decide);
    let receiver = QueueReceiver::new(Arc::new(transport.clone()), config);
    let handle = receiver.connect(outbound).await.unwrap();
    (handle, seen)
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn attempts_of(seen: &Seen, payload: &[u8]) -> Vec<u32> {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|(p, _)| p == payload)
        .map(|(_, attempt)| *attempt)
        .collect()
}

#[tokio::test]
async fn ack_on_first_delivery_publishes_nothing() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);
    transport.produce(TOPIC, 0, b"order-1");

    let (handle, seen) = start(&transport, config(3), |_, _| Outcome::Ack).await;
    eventually("commit", || transport.committed(TOPIC, 0) == Some(1)).await;

    assert_eq!(attempts_of(&seen, b"order-1"), vec![0]);
    assert!(transport.published(DEAD_LETTERS).is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn always_nack_delivers_k_plus_one_times_then_dead_letters_once() {
    for k in 0..4 {
        let transport = MemoryTransport::new();
        transport.create_topic(TOPIC, 1);
        transport.produce(TOPIC, 0, b"poison");

        let (handle, seen) = start(&transport, config(k), |_, _| Outcome::Nack).await;
        eventually("commit", || transport.committed(TOPIC, 0) == Some(1)).await;

        let expected: Vec<u32> = (0..=k).collect();
        assert_eq!(attempts_of(&seen, b"poison"), expected);
        assert_eq!(transport.published(DEAD_LETTERS), vec![b"poison".to_vec()]);
        handle.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn three_nacks_then_ack_succeeds_without_dead_letter() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);
    transport.produce(TOPIC, 0, b"flaky");

    let (handle, seen) = start(&transport, config(3), |_, attempt| {
        if attempt < 3 { Outcome::Nack } else { Outcome::Ack }
    })
    .await;
    eventually("commit", || transport.committed(TOPIC, 0) == Some(1)).await;

    assert_eq!(attempts_of(&seen, b"flaky"), vec![0, 1, 2, 3]);
    assert!(transport.published(DEAD_LETTERS).is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn zero_attempts_dead_letters_original_bytes() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);
    let payload = b"\x00\x01binary\xfe\xff";
    transport.produce(TOPIC, 0, payload);

    let (handle, seen) = start(&transport, config(0), |_, _| Outcome::Nack).await;
    eventually("commit", || transport.committed(TOPIC, 0) == Some(1)).await;

    assert_eq!(attempts_of(&seen, payload), vec![0]);
    assert_eq!(transport.published(DEAD_LETTERS), vec![payload.to_vec()]);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_dead_letter_drops_message_and_keeps_going() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);
    transport.fail_publishes(DEAD_LETTERS);
    transport.produce(TOPIC, 0, b"doomed");
    transport.produce(TOPIC, 0, b"fine");

    let metrics = Metrics::new().unwrap();
    let (outbound, items) = mpsc::channel(4);
    let (seen, _) = spawn_consumer(items, |payload, _| {
        if payload == b"fine" { Outcome::Ack } else { Outcome::Nack }
    });
    let receiver = QueueReceiver::new(Arc::new(transport.clone()), config(1))
        .with_metrics(metrics.clone());
    let handle = receiver.connect(outbound).await.unwrap();

    eventually("both commits", || transport.committed(TOPIC, 0) == Some(2)).await;

    assert_eq!(attempts_of(&seen, b"doomed"), vec![0, 1]);
    assert_eq!(attempts_of(&seen, b"fine"), vec![0]);
    assert!(transport.published(DEAD_LETTERS).is_empty());
    assert_eq!(transport.open_publishers(), 0);
    assert_eq!(metrics.messages_lost_total.get(), 1.0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn reruns_produce_identical_delivery_sequences() {
    async fn scenario() -> (Vec<(Vec<u8>, u32)>, Vec<Vec<u8>>) {
        let transport = MemoryTransport::new();
        transport.create_topic(TOPIC, 1);
        for payload in [&b"a"[..], b"b", b"c"] {
            transport.produce(TOPIC, 0, payload);
        }

        let (handle, seen) = start(&transport, config(2), |payload, attempt| match payload {
            b"b" if attempt < 2 => Outcome::Nack,
            b"c" => Outcome::Nack,
            _ => Outcome::Ack,
        })
        .await;
        eventually("all commits", || transport.committed(TOPIC, 0) == Some(3)).await;
        handle.shutdown().await.unwrap();

        let deliveries = seen.lock().unwrap().clone();
        (deliveries, transport.published(DEAD_LETTERS))
    }

    let first = scenario().await;
    let second = scenario().await;

    assert_eq!(first, second);
    let expected: Vec<(Vec<u8>, u32)> = vec![
        (b"a".to_vec(), 0),
        (b"b".to_vec(), 0),
        (b"b".to_vec(), 1),
        (b"b".to_vec(), 2),
        (b"c".to_vec(), 0),
        (b"c".to_vec(), 1),
        (b"c".to_vec(), 2),
    ];
    assert_eq!(first.0, expected);
    assert_eq!(first.1, vec![b"c".to_vec()]);
}

#[tokio::test]
async fn unreachable_brokers_fail_connect() {
    let transport = MemoryTransport::new();
    transport.refuse_sessions(true);

    let (outbound, _items) = mpsc::channel(1);
    let receiver = QueueReceiver::new(Arc::new(transport.clone()), config(3));
    let result = receiver.connect(outbound).await;

    assert!(matches!(result, Err(ConnectError::Session(_))));
}

#[tokio::test]
async fn next_message_waits_for_previous_to_finish_retrying() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);
    transport.produce(TOPIC, 0, b"first");
    transport.produce(TOPIC, 0, b"second");

    let config = ReceiverConfig::new("billing", TOPIC)
        .with_policy(RetryPolicy::new(2, Constant(Duration::from_millis(20))));
    let (handle, seen) = start(&transport, config, |payload, attempt| {
        if payload == b"first" && attempt < 2 { Outcome::Nack } else { Outcome::Ack }
    })
    .await;
    eventually("both commits", || transport.committed(TOPIC, 0) == Some(2)).await;

    let order: Vec<(Vec<u8>, u32)> = seen.lock().unwrap().clone();
    assert_eq!(
        order,
        vec![
            (b"first".to_vec(), 0),
            (b"first".to_vec(), 1),
            (b"first".to_vec(), 2),
            (b"second".to_vec(), 0),
        ]
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn stalled_partition_does_not_block_others() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 2);
    transport.produce(TOPIC, 0, b"slow");
    transport.produce(TOPIC, 1, b"fast");

    let (outbound, mut items) = mpsc::channel(4);
    let receiver = QueueReceiver::new(Arc::new(transport.clone()), config(3));
    let handle = receiver.connect(outbound).await.unwrap();

    let mut held = Vec::new();
    let stall = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(item) = items.recv().await {
            if item.payload() == b"slow" {
                held.push(item);
            } else {
                item.ack();
                break;
            }
        }
    })
    .await;
    assert!(stall.is_ok());

    eventually("fast partition commit", || transport.committed(TOPIC, 1) == Some(1)).await;
    assert_eq!(transport.committed(TOPIC, 0), None);

    for item in held {
        item.ack();
    }
    eventually("slow partition commit", || transport.committed(TOPIC, 0) == Some(1)).await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn abandon_shutdown_leaves_in_flight_message_uncommitted() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);
    transport.produce(TOPIC, 0, b"held");

    let (outbound, mut items) = mpsc::channel(4);
    let receiver = QueueReceiver::new(Arc::new(transport.clone()), config(3));
    let handle = receiver.connect(outbound).await.unwrap();

    let held = tokio::time::timeout(Duration::from_secs(5), items.recv())
        .await
        .unwrap()
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
        .await
        .unwrap()
        .unwrap();

    held.ack();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.committed(TOPIC, 0), None);
}

#[tokio::test]
async fn drain_shutdown_finishes_in_flight_message() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);
    transport.produce(TOPIC, 0, b"slow-ack");

    let (outbound, mut items) = mpsc::channel(4);
    let config = config(3).with_shutdown(ShutdownMode::Drain {
        timeout: Duration::from_secs(2),
    });
    let receiver = QueueReceiver::new(Arc::new(transport.clone()), config);
    let handle = receiver.connect(outbound).await.unwrap();

    let item = tokio::time::timeout(Duration::from_secs(5), items.recv())
        .await
        .unwrap()
        .unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        item.ack();
    });

    handle.shutdown().await.unwrap();
    assert_eq!(transport.committed(TOPIC, 0), Some(1));
}

#[tokio::test]
async fn drain_timeout_abandons_stuck_message() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);
    transport.produce(TOPIC, 0, b"stuck");

    let (outbound, mut items) = mpsc::channel(4);
    let config = config(3).with_shutdown(ShutdownMode::Drain {
        timeout: Duration::from_millis(50),
    });
    let receiver = QueueReceiver::new(Arc::new(transport.clone()), config);
    let handle = receiver.connect(outbound).await.unwrap();

    let _held = tokio::time::timeout(Duration::from_secs(5), items.recv())
        .await
        .unwrap()
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.committed(TOPIC, 0), None);
}

#[tokio::test]
async fn revoked_partition_stops_receiving() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);
    transport.produce(TOPIC, 0, b"before");

    let (handle, seen) = start(&transport, config(3), |_, _| Outcome::Ack).await;
    eventually("first commit", || transport.committed(TOPIC, 0) == Some(1)).await;

    transport.revoke(0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.produce(TOPIC, 0, b"after");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(attempts_of(&seen, b"after").is_empty());
    assert_eq!(transport.committed(TOPIC, 0), Some(1));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn closed_session_completes_handle() {
    let transport = MemoryTransport::new();
    transport.create_topic(TOPIC, 1);

    let metrics = Metrics::new().unwrap();
    let (outbound, _items) = mpsc::channel(4);
    let receiver = QueueReceiver::new(Arc::new(transport.clone()), config(3))
        .with_metrics(metrics.clone());
    let mut handle = receiver.connect(outbound).await.unwrap();
    eventually("worker start", || metrics.active_partitions.get() == 1.0).await;

    transport.close();

    tokio::time::timeout(Duration::from_secs(2), handle.done())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metrics.active_partitions.get(), 0.0);
    handle.shutdown().await.unwrap();
}
