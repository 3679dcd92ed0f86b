use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::OwnedMessage;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};
use crate::types::{OffsetWatermark, Partition, PartitionAssignment, PartitionOffset};

/// One poll step's worth of output from the underlying client.
#[derive(Debug)]
pub enum FetchEvent {
    Message(OwnedMessage),
    /// The partition's high watermark was reached in this assignment.
    PartitionEof(Partition),
    /// Nothing arrived within the poll timeout.
    Idle,
}

/// Rebalance notifications forwarded from the client's callback thread.
#[derive(Debug)]
pub enum RebalanceEvent {
    Assigned(Vec<PartitionAssignment>),
    Revoked(Vec<Partition>),
    Error(KafkaError),
}

/// The broker-facing contract the pipeline consumes: fetch, commit, offset
/// store, group metadata, and flow control. The production implementation
/// wraps an `rdkafka` consumer; tests substitute a scripted one.
#[async_trait]
pub trait KafkaClient: Send + Sync + 'static {
    fn subscribe(&self, topic: &str) -> KafkaResult<()>;

    /// Statically assign partitions at explicit offsets.
    fn assign(&self, offsets: &[PartitionOffset]) -> KafkaResult<()>;

    fn unassign(&self) -> KafkaResult<()>;

    /// Pull the next event, waiting at most `timeout`.
    async fn fetch(&self, timeout: Duration) -> KafkaResult<FetchEvent>;

    /// Synchronously commit `offsets` (each the next offset to consume).
    async fn commit(&self, offsets: &[PartitionOffset]) -> KafkaResult<()>;

    /// Hand offsets to the client's in-memory store for background flush.
    fn store(&self, offsets: &[PartitionOffset]) -> KafkaResult<()>;

    /// The group's committed offset for a partition, if one exists.
    /// `timeout` of `None` blocks indefinitely.
    async fn committed_offset(
        &self,
        partition: &Partition,
        timeout: Option<Duration>,
    ) -> KafkaResult<Option<i64>>;

    async fn watermarks(
        &self,
        partition: &Partition,
        timeout: Option<Duration>,
    ) -> KafkaResult<OffsetWatermark>;

    fn pause(&self, partitions: &[Partition]) -> KafkaResult<()>;

    fn resume(&self, partitions: &[Partition]) -> KafkaResult<()>;

    /// Take the rebalance event stream. Yields `Some` exactly once.
    fn take_rebalance_events(&self) -> Option<mpsc::UnboundedReceiver<RebalanceEvent>>;
}

fn to_timeout(timeout: Option<Duration>) -> Timeout {
    match timeout {
        Some(duration) => Timeout::After(duration),
        None => Timeout::Never,
    }
}

fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::with_capacity(partitions.len());
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

fn offset_list(offsets: &[PartitionOffset]) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::with_capacity(offsets.len());
    for po in offsets {
        tpl.add_partition_offset(
            po.topic(),
            po.partition_number(),
            Offset::Offset(po.offset()),
        )?;
    }
    Ok(tpl)
}

/// Consumer context that forwards rebalance callbacks onto a channel, so the
/// manager's async rebalance worker can react outside the client's callback
/// thread.
pub struct PipelineContext {
    rebalance_tx: mpsc::UnboundedSender<RebalanceEvent>,
}

impl PipelineContext {
    pub fn new(rebalance_tx: mpsc::UnboundedSender<RebalanceEvent>) -> Self {
        Self { rebalance_tx }
    }

    fn send(&self, event: RebalanceEvent) {
        if self.rebalance_tx.send(event).is_err() {
            error!("rebalance worker is gone; dropping rebalance event");
        }
    }
}

impl ClientContext for PipelineContext {}

impl ConsumerContext for PipelineContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!(count = partitions.count(), "partitions being revoked");
                let partitions = partitions
                    .elements()
                    .into_iter()
                    .map(Partition::from)
                    .collect();
                self.send(RebalanceEvent::Revoked(partitions));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!(error = %e, "rebalance error");
                self.send(RebalanceEvent::Error(e.clone()));
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(count = partitions.count(), "partitions assigned");
                let assignments = partitions
                    .elements()
                    .into_iter()
                    .map(PartitionAssignment::from)
                    .collect();
                self.send(RebalanceEvent::Assigned(assignments));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                error!(error = %e, "post-rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {
                info!(count = offsets.count(), "offsets committed");
            }
            Err(e) => {
                warn!(error = %e, "offset commit failed");
            }
        }
    }
}

/// Production client over an `rdkafka` stream consumer.
///
/// One client serves one topic; the manager creates a client per managed
/// topic, which keeps EOF events (which the wire protocol reports by
/// partition id only) unambiguous.
pub struct RdKafkaClient {
    topic: String,
    consumer: StreamConsumer<PipelineContext>,
    rebalance_rx: Mutex<Option<mpsc::UnboundedReceiver<RebalanceEvent>>>,
}

impl RdKafkaClient {
    pub fn new(topic: impl Into<String>, client_config: &ClientConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<PipelineContext> = client_config
            .create_with_context(PipelineContext::new(tx))
            .map_err(PipelineError::from_kafka)?;
        Ok(Self {
            topic: topic.into(),
            consumer,
            rebalance_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl KafkaClient for RdKafkaClient {
    fn subscribe(&self, topic: &str) -> KafkaResult<()> {
        self.consumer.subscribe(&[topic])
    }

    fn assign(&self, offsets: &[PartitionOffset]) -> KafkaResult<()> {
        self.consumer.assign(&offset_list(offsets)?)
    }

    fn unassign(&self) -> KafkaResult<()> {
        self.consumer.unsubscribe();
        Ok(())
    }

    async fn fetch(&self, timeout: Duration) -> KafkaResult<FetchEvent> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(FetchEvent::Idle),
            Ok(Ok(message)) => Ok(FetchEvent::Message(message.detach())),
            Ok(Err(KafkaError::PartitionEOF(partition))) => Ok(FetchEvent::PartitionEof(
                Partition::new(self.topic.clone(), partition),
            )),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> KafkaResult<()> {
        self.consumer
            .commit(&offset_list(offsets)?, CommitMode::Sync)
    }

    fn store(&self, offsets: &[PartitionOffset]) -> KafkaResult<()> {
        self.consumer.store_offsets(&offset_list(offsets)?)
    }

    async fn committed_offset(
        &self,
        partition: &Partition,
        timeout: Option<Duration>,
    ) -> KafkaResult<Option<i64>> {
        let mut tpl = TopicPartitionList::with_capacity(1);
        tpl.add_partition(partition.topic(), partition.partition_number());
        let committed = self.consumer.committed_offsets(tpl, to_timeout(timeout))?;
        Ok(committed
            .find_partition(partition.topic(), partition.partition_number())
            .and_then(|elem| match elem.offset() {
                Offset::Offset(offset) if offset >= 0 => Some(offset),
                _ => None,
            }))
    }

    async fn watermarks(
        &self,
        partition: &Partition,
        timeout: Option<Duration>,
    ) -> KafkaResult<OffsetWatermark> {
        let (low, high) = self.consumer.fetch_watermarks(
            partition.topic(),
            partition.partition_number(),
            to_timeout(timeout),
        )?;
        Ok(OffsetWatermark::new(low, high))
    }

    fn pause(&self, partitions: &[Partition]) -> KafkaResult<()> {
        self.consumer.pause(&partition_list(partitions))
    }

    fn resume(&self, partitions: &[Partition]) -> KafkaResult<()> {
        self.consumer.resume(&partition_list(partitions))
    }

    fn take_rebalance_events(&self) -> Option<mpsc::UnboundedReceiver<RebalanceEvent>> {
        self.rebalance_rx.lock().unwrap().take()
    }
}
