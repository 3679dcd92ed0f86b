//! Scripted in-memory client for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{OwnedHeaders, OwnedMessage, Timestamp};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::client::{FetchEvent, KafkaClient, RebalanceEvent};
use crate::types::{OffsetWatermark, Partition, PartitionAssignment, PartitionOffset};

/// Build a message the way the broker would deliver it.
pub fn test_message(topic: &str, partition: i32, offset: i64, payload: &str) -> OwnedMessage {
    OwnedMessage::new(
        Some(payload.as_bytes().to_vec()),
        Some(format!("key-{offset}").into_bytes()),
        topic.to_string(),
        Timestamp::now(),
        partition,
        offset,
        Some(OwnedHeaders::new()),
    )
}

/// In-memory [`KafkaClient`] with a scripted fetch queue and recorded commit
/// traffic. Rebalance events are injected by the test through
/// [`MockKafkaClient::trigger_assign`] / [`MockKafkaClient::trigger_revoke`].
pub struct MockKafkaClient {
    queue: Mutex<VecDeque<FetchEvent>>,
    committed: Mutex<HashMap<Partition, i64>>,
    stored: Mutex<HashMap<Partition, i64>>,
    watermarks: Mutex<HashMap<Partition, OffsetWatermark>>,
    commit_log: Mutex<Vec<PartitionOffset>>,
    paused: Mutex<HashSet<Partition>>,
    fail_commits: AtomicU32,
    rebalance_tx: mpsc::UnboundedSender<RebalanceEvent>,
    rebalance_rx: Mutex<Option<mpsc::UnboundedReceiver<RebalanceEvent>>>,
}

impl Default for MockKafkaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKafkaClient {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            queue: Mutex::new(VecDeque::new()),
            committed: Mutex::new(HashMap::new()),
            stored: Mutex::new(HashMap::new()),
            watermarks: Mutex::new(HashMap::new()),
            commit_log: Mutex::new(Vec::new()),
            paused: Mutex::new(HashSet::new()),
            fail_commits: AtomicU32::new(0),
            rebalance_tx: tx,
            rebalance_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn set_watermarks(&self, partition: &Partition, watermark: OffsetWatermark) {
        self.watermarks
            .lock()
            .unwrap()
            .insert(partition.clone(), watermark);
    }

    pub fn set_committed(&self, partition: &Partition, offset: i64) {
        self.committed
            .lock()
            .unwrap()
            .insert(partition.clone(), offset);
    }

    pub fn push_message(&self, message: OwnedMessage) {
        self.queue
            .lock()
            .unwrap()
            .push_back(FetchEvent::Message(message));
    }

    pub fn push_eof(&self, partition: Partition) {
        self.queue
            .lock()
            .unwrap()
            .push_back(FetchEvent::PartitionEof(partition));
    }

    /// Queue `count` messages for a partition starting at `first_offset`.
    pub fn push_messages(&self, topic: &str, partition: i32, first_offset: i64, count: i64) {
        for offset in first_offset..first_offset + count {
            self.push_message(test_message(
                topic,
                partition,
                offset,
                &format!("payload-{offset}"),
            ));
        }
    }

    /// Make the next `count` commit calls fail with a retryable error.
    pub fn fail_next_commits(&self, count: u32) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Number of scripted events the consumer has not pulled yet.
    pub fn queued_fetch_events(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn commit_log(&self) -> Vec<PartitionOffset> {
        self.commit_log.lock().unwrap().clone()
    }

    pub fn clear_commit_log(&self) {
        self.commit_log.lock().unwrap().clear();
    }

    pub fn committed_offset_for(&self, partition: &Partition) -> Option<i64> {
        self.committed.lock().unwrap().get(partition).copied()
    }

    pub fn stored_offset(&self, partition: &Partition) -> Option<i64> {
        self.stored.lock().unwrap().get(partition).copied()
    }

    pub fn paused_partitions(&self) -> HashSet<Partition> {
        self.paused.lock().unwrap().clone()
    }

    pub fn trigger_assign(&self, assignments: Vec<PartitionAssignment>) {
        let _ = self.rebalance_tx.send(RebalanceEvent::Assigned(assignments));
    }

    pub fn trigger_revoke(&self, partitions: Vec<Partition>) {
        let _ = self.rebalance_tx.send(RebalanceEvent::Revoked(partitions));
    }
}

#[async_trait]
impl KafkaClient for MockKafkaClient {
    fn subscribe(&self, _topic: &str) -> KafkaResult<()> {
        Ok(())
    }

    fn assign(&self, _offsets: &[PartitionOffset]) -> KafkaResult<()> {
        Ok(())
    }

    fn unassign(&self) -> KafkaResult<()> {
        Ok(())
    }

    async fn fetch(&self, timeout: Duration) -> KafkaResult<FetchEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.queue.lock().unwrap().pop_front() {
                return Ok(event);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(FetchEvent::Idle);
            }
            sleep(Duration::from_millis(2)).await;
        }
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> KafkaResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) > 0 {
            self.fail_commits.fetch_sub(1, Ordering::SeqCst);
            return Err(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::OperationTimedOut,
            ));
        }
        let mut committed = self.committed.lock().unwrap();
        let mut log = self.commit_log.lock().unwrap();
        for po in offsets {
            committed.insert(po.partition().clone(), po.offset());
            log.push(po.clone());
        }
        Ok(())
    }

    fn store(&self, offsets: &[PartitionOffset]) -> KafkaResult<()> {
        let mut stored = self.stored.lock().unwrap();
        for po in offsets {
            stored.insert(po.partition().clone(), po.offset());
        }
        Ok(())
    }

    async fn committed_offset(
        &self,
        partition: &Partition,
        _timeout: Option<Duration>,
    ) -> KafkaResult<Option<i64>> {
        Ok(self.committed.lock().unwrap().get(partition).copied())
    }

    async fn watermarks(
        &self,
        partition: &Partition,
        _timeout: Option<Duration>,
    ) -> KafkaResult<OffsetWatermark> {
        self.watermarks
            .lock()
            .unwrap()
            .get(partition)
            .copied()
            .ok_or(KafkaError::MetadataFetch(
                RDKafkaErrorCode::UnknownTopicOrPartition,
            ))
    }

    fn pause(&self, partitions: &[Partition]) -> KafkaResult<()> {
        let mut paused = self.paused.lock().unwrap();
        for partition in partitions {
            paused.insert(partition.clone());
        }
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> KafkaResult<()> {
        let mut paused = self.paused.lock().unwrap();
        for partition in partitions {
            paused.remove(partition);
        }
        Ok(())
    }

    fn take_rebalance_events(&self) -> Option<mpsc::UnboundedReceiver<RebalanceEvent>> {
        self.rebalance_rx.lock().unwrap().take()
    }
}
