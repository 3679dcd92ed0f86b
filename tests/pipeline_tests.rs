//! End-to-end pipeline behaviour against the scripted client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::sleep;

use kafka_pipeline::testing::MockKafkaClient;
use kafka_pipeline::{
    AssignmentPhase, BrokerTimeout, BytesParser, CommitGuard, ConsumerManager, ExecMode,
    KafkaClient, MessageReceiver, OffsetWatermark, Partition, PartitionAssignment, PartitionOffset,
    PipelineConfig, PipelineError, PipelineObserver, ReceivedMessage, StartOffset,
};

const TOPIC: &str = "orders";

fn partition(n: i32) -> Partition {
    Partition::new(TOPIC, n)
}

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.poll_timeout = BrokerTimeout::Millis(30);
    config.min_poll_interval = Duration::from_millis(5);
    config.commit_exec = ExecMode::Sync;
    config.receive_callback_exec = ExecMode::Sync;
    config
}

/// Receiver that records (partition, offset) pairs and relies on the
/// automatic persist.
#[derive(Default)]
struct CountingReceiver {
    seen: Mutex<Vec<(i32, i64)>>,
}

impl CountingReceiver {
    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn offsets(&self, partition: i32) -> Vec<i64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, o)| *o)
            .collect()
    }
}

#[async_trait]
impl MessageReceiver<Vec<u8>, Vec<u8>> for CountingReceiver {
    async fn receive(
        &self,
        message: ReceivedMessage<Vec<u8>, Vec<u8>>,
        _guard: CommitGuard,
    ) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((message.partition_number(), message.offset()));
        Ok(())
    }
}

/// Receiver that parks inside `receive` until the test opens its gate.
struct GatedReceiver {
    entered: Arc<Notify>,
    gate: Arc<Notify>,
    completed: AtomicUsize,
}

#[async_trait]
impl MessageReceiver<Vec<u8>, Vec<u8>> for GatedReceiver {
    async fn receive(
        &self,
        _message: ReceivedMessage<Vec<u8>, Vec<u8>>,
        _guard: CommitGuard,
    ) -> anyhow::Result<()> {
        self.entered.notify_one();
        self.gate.notified().await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct EventLog {
    eofs: Mutex<Vec<Partition>>,
    errors: AtomicUsize,
}

impl PipelineObserver for EventLog {
    fn on_error(&self, _error: &PipelineError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_partition_eof(&self, partition: &Partition) {
        self.eofs.lock().unwrap().push(partition.clone());
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn pause_on_start_defers_delivery_until_resume() {
    let mut config = fast_config();
    config.pause_on_start = true;

    let client = Arc::new(MockKafkaClient::new());
    let partitions: Vec<i32> = (0..4).collect();
    for &p in &partitions {
        client.set_watermarks(&partition(p), OffsetWatermark::new(0, 100));
    }

    let observer = Arc::new(EventLog::default());
    let receiver = Arc::new(CountingReceiver::default());
    let manager = ConsumerManager::with_hooks(
        config,
        BytesParser,
        ArcReceiver(receiver.clone()),
        None,
        observer.clone(),
    );
    manager
        .add_topic(TOPIC, client.clone() as Arc<dyn KafkaClient>)
        .unwrap();
    manager.start().await.unwrap();

    client.trigger_assign(
        partitions
            .iter()
            .map(|&p| PartitionAssignment::new(partition(p), StartOffset::End))
            .collect(),
    );
    wait_until("assignment to land", || {
        partitions
            .iter()
            .all(|&p| manager.partition_phase(&partition(p)) == Some(AssignmentPhase::Paused))
    })
    .await;

    // Assignment happened, but nothing may reach the receiver yet.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(receiver.count(), 0);
    // The client was told to stop fetching these partitions.
    assert_eq!(client.paused_partitions().len(), 4);

    // Messages published after the END snapshot stay with the broker while
    // paused, and none of them are lost.
    for &p in &partitions {
        client.push_messages(TOPIC, p, 100, 3);
    }
    sleep(Duration::from_millis(80)).await;
    assert_eq!(receiver.count(), 0);

    manager.resume(TOPIC).await.unwrap();
    wait_until("deliveries after resume", || receiver.count() == 12).await;

    for &p in &partitions {
        client.push_eof(partition(p));
    }
    wait_until("eof on all partitions", || {
        observer.eofs.lock().unwrap().len() == 4
    })
    .await;
    assert!(partitions
        .iter()
        .all(|&p| manager.partition_eof_seen(&partition(p))));
    assert_eq!(observer.errors.load(Ordering::SeqCst), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn out_of_order_acks_advance_watermark_in_steps() {
    let config = fast_config();
    let client = Arc::new(MockKafkaClient::new());
    client.set_watermarks(&partition(0), OffsetWatermark::new(100, 200));

    let receiver = Arc::new(CountingReceiver::default());
    let manager = ConsumerManager::new(config, BytesParser, ArcReceiver(receiver));
    manager
        .add_topic(TOPIC, client.clone() as Arc<dyn KafkaClient>)
        .unwrap();
    let offsets = manager.offset_manager();
    offsets
        .install_assignment(&[PartitionAssignment::new(
            partition(0),
            StartOffset::Beginning,
        )])
        .await
        .unwrap();

    let mut trace = Vec::new();
    for ack in [102, 100, 103, 101] {
        offsets
            .save_offset(&PartitionOffset::new(partition(0), ack), None)
            .await
            .unwrap();
        trace.push(offsets.current_offset(&partition(0)).unwrap());
    }
    assert_eq!(trace, vec![99, 100, 100, 103]);
    // The broker position is one past the acknowledged prefix.
    assert_eq!(client.commit_log().last().unwrap().offset(), 104);
}

#[tokio::test]
async fn tail_assignment_rewinds_from_high_watermark() {
    let client = Arc::new(MockKafkaClient::new());
    client.set_watermarks(&partition(0), OffsetWatermark::new(0, 200));

    let observer = Arc::new(EventLog::default());
    let receiver = Arc::new(CountingReceiver::default());
    let manager = ConsumerManager::with_hooks(
        fast_config(),
        BytesParser,
        ArcReceiver(receiver.clone()),
        None,
        observer.clone(),
    );
    manager
        .add_topic(TOPIC, client.clone() as Arc<dyn KafkaClient>)
        .unwrap();
    manager.start().await.unwrap();

    manager
        .assign_partitions(
            TOPIC,
            vec![PartitionAssignment::new(partition(0), StartOffset::Tail(5))],
        )
        .await
        .unwrap();
    assert_eq!(manager.offset_manager().begin_offset(&partition(0)).unwrap(), 195);

    // Exactly the five tail messages, then EOF.
    client.push_messages(TOPIC, 0, 195, 5);
    client.push_eof(partition(0));
    wait_until("tail messages delivered", || receiver.count() == 5).await;
    wait_until("eof seen", || manager.partition_eof_seen(&partition(0))).await;
    assert_eq!(receiver.offsets(0), vec![195, 196, 197, 198, 199]);

    manager.shutdown().await;
}

#[tokio::test]
async fn stored_start_resumes_where_previous_consumer_committed() {
    let watermark = OffsetWatermark::new(195, 201);

    // First consumer reads 195 and 196 from the beginning, then shuts down.
    let first_client = Arc::new(MockKafkaClient::new());
    first_client.set_watermarks(&partition(0), watermark);
    let first_receiver = Arc::new(CountingReceiver::default());
    let first = ConsumerManager::new(
        fast_config(),
        BytesParser,
        ArcReceiver(first_receiver.clone()),
    );
    first
        .add_topic(TOPIC, first_client.clone() as Arc<dyn KafkaClient>)
        .unwrap();
    first.start().await.unwrap();
    first
        .assign_partitions(
            TOPIC,
            vec![PartitionAssignment::new(
                partition(0),
                StartOffset::Beginning,
            )],
        )
        .await
        .unwrap();
    first_client.push_messages(TOPIC, 0, 195, 2);
    wait_until("first consumer deliveries", || first_receiver.count() == 2).await;
    first.shutdown().await;
    assert_eq!(first_client.committed_offset_for(&partition(0)), Some(197));

    // Second consumer joins the same group: the broker remembers 197.
    let second_client = Arc::new(MockKafkaClient::new());
    second_client.set_watermarks(&partition(0), watermark);
    second_client.set_committed(
        &partition(0),
        first_client.committed_offset_for(&partition(0)).unwrap(),
    );
    let second_receiver = Arc::new(CountingReceiver::default());
    let second = ConsumerManager::new(
        fast_config(),
        BytesParser,
        ArcReceiver(second_receiver.clone()),
    );
    second
        .add_topic(TOPIC, second_client.clone() as Arc<dyn KafkaClient>)
        .unwrap();
    second.start().await.unwrap();
    second
        .assign_partitions(
            TOPIC,
            vec![PartitionAssignment::new(partition(0), StartOffset::Stored)],
        )
        .await
        .unwrap();
    assert_eq!(
        second.offset_manager().begin_offset(&partition(0)).unwrap(),
        197
    );

    second_client.push_messages(TOPIC, 0, 197, 4);
    wait_until("second consumer deliveries", || {
        second_receiver.count() == 4
    })
    .await;
    second.shutdown().await;

    // Together the two consumers covered [195, 200] exactly once.
    let mut all: Vec<i64> = first_receiver
        .offsets(0)
        .into_iter()
        .chain(second_receiver.offsets(0))
        .collect();
    all.sort_unstable();
    assert_eq!(all, vec![195, 196, 197, 198, 199, 200]);
}

#[tokio::test]
async fn revocation_waits_for_in_flight_receiver_then_commits() {
    let mut config = fast_config();
    config.receive_callback_exec = ExecMode::Async;

    let client = Arc::new(MockKafkaClient::new());
    client.set_watermarks(&partition(0), OffsetWatermark::new(0, 100));

    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let receiver = Arc::new(GatedReceiver {
        entered: entered.clone(),
        gate: gate.clone(),
        completed: AtomicUsize::new(0),
    });
    let manager = ConsumerManager::new(config, BytesParser, ArcReceiver(receiver.clone()));
    manager
        .add_topic(TOPIC, client.clone() as Arc<dyn KafkaClient>)
        .unwrap();
    manager.start().await.unwrap();

    client.trigger_assign(vec![PartitionAssignment::new(
        partition(0),
        StartOffset::Beginning,
    )]);
    wait_until("assignment", || {
        manager.partition_phase(&partition(0)) == Some(AssignmentPhase::Assigned)
    })
    .await;

    client.push_messages(TOPIC, 0, 0, 1);
    entered.notified().await;

    // Revoke while the receiver is still inside its callback.
    client.trigger_revoke(vec![partition(0)]);
    sleep(Duration::from_millis(60)).await;
    // The drain is still blocked on the receiver: no commit, tracker intact.
    assert!(client.commit_log().is_empty());
    assert_eq!(
        manager.partition_phase(&partition(0)),
        Some(AssignmentPhase::Revoking)
    );

    gate.notify_one();
    wait_until("revocation commit", || !client.commit_log().is_empty()).await;
    assert_eq!(receiver.completed.load(Ordering::SeqCst), 1);
    assert_eq!(client.commit_log().last().unwrap().offset(), 1);
    wait_until("state cleared", || {
        manager.partition_phase(&partition(0)).is_none()
    })
    .await;

    // A later assignment under the same group resumes past the commit; the
    // acknowledged offset is not redelivered.
    client.trigger_assign(vec![PartitionAssignment::new(
        partition(0),
        StartOffset::Stored,
    )]);
    wait_until("reassignment", || {
        manager.partition_phase(&partition(0)).is_some()
    })
    .await;
    assert_eq!(manager.offset_manager().begin_offset(&partition(0)).unwrap(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn full_range_consumption_commits_without_gaps() {
    let config = fast_config();
    let client = Arc::new(MockKafkaClient::new());
    client.set_watermarks(&partition(0), OffsetWatermark::new(100, 110));

    let receiver = Arc::new(CountingReceiver::default());
    let manager = ConsumerManager::new(config, BytesParser, ArcReceiver(receiver.clone()));
    manager
        .add_topic(TOPIC, client.clone() as Arc<dyn KafkaClient>)
        .unwrap();
    manager.start().await.unwrap();
    manager
        .assign_partitions(
            TOPIC,
            vec![PartitionAssignment::new(
                partition(0),
                StartOffset::Beginning,
            )],
        )
        .await
        .unwrap();

    client.push_messages(TOPIC, 0, 100, 10);
    wait_until("all messages delivered", || receiver.count() == 10).await;
    manager.shutdown().await;

    let log = client.commit_log();
    // Committed positions only ever move forward, and the final position
    // covers the whole range with no gaps.
    assert!(log.windows(2).all(|w| w[0].offset() <= w[1].offset()));
    assert_eq!(log.last().unwrap().offset(), 110);
    assert_eq!(client.committed_offset_for(&partition(0)), Some(110));
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let client = Arc::new(MockKafkaClient::new());
    let receiver = Arc::new(CountingReceiver::default());
    let manager = ConsumerManager::new(fast_config(), BytesParser, ArcReceiver(receiver));
    manager
        .add_topic(TOPIC, client.clone() as Arc<dyn KafkaClient>)
        .unwrap();
    manager.start().await.unwrap();

    manager.shutdown().await;
    // A second shutdown returns immediately and does not panic.
    manager.shutdown().await;
}

#[tokio::test]
async fn backoff_cap_below_interval_fails_construction() {
    let err = PipelineConfig::from_options([
        ("internal.consumer.commit.backoff.interval.ms", "50"),
        ("internal.consumer.commit.max.backoff.ms", "49"),
    ])
    .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidOption { .. }));
}

/// Adapter so tests can keep a handle on the receiver they hand to the
/// manager.
struct ArcReceiver<R>(Arc<R>);

#[async_trait]
impl<R> MessageReceiver<Vec<u8>, Vec<u8>> for ArcReceiver<R>
where
    R: MessageReceiver<Vec<u8>, Vec<u8>>,
{
    async fn receive(
        &self,
        message: ReceivedMessage<Vec<u8>, Vec<u8>>,
        guard: CommitGuard,
    ) -> anyhow::Result<()> {
        self.0.receive(message, guard).await
    }
}
