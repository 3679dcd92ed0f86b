use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::KafkaClient;
use crate::config::{BrokerTimeout, ExecMode, PersistStrategy, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::metrics_consts::{COMMITS, COMMIT_FAILURES, COMMIT_RETRIES, CURRENT_OFFSET, OFFSETS_STORED};
use crate::observer::PipelineObserver;
use crate::offsets::tracker::OffsetTracker;
use crate::retry::CommitRetryPolicy;
use crate::types::{Partition, PartitionAssignment, PartitionOffset, StartOffset};

/// Fallback for broker metadata and commit calls when the timeout option is
/// left at its default.
const DEFAULT_BROKER_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do with tracker state when partitions are reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAction {
    /// Clear trackers and re-initialize them from broker-committed offsets
    /// and watermarks.
    FetchOffsets,
    /// Clear trackers only.
    ClearOnly,
}

struct TopicEntry {
    client: Arc<dyn KafkaClient>,
    auto_reset_at_end: bool,
}

/// Adapts per-partition acknowledgment trackers to Kafka commit semantics.
///
/// Two persist strategies (broker commit vs client-side store) and two exec
/// modes (blocking vs background with retry) compose into four regimes; all
/// of them only ever persist offsets whose entire prefix has been
/// acknowledged.
pub struct OffsetManager {
    topics: DashMap<String, TopicEntry>,
    trackers: DashMap<Partition, Arc<OffsetTracker>>,
    observer: Arc<dyn PipelineObserver>,
    persist_strategy: PersistStrategy,
    default_exec: ExecMode,
    broker_timeout: Option<Duration>,
    retry: CommitRetryPolicy,
    trace_commits: AtomicBool,
}

impl OffsetManager {
    pub fn new(config: &PipelineConfig, observer: Arc<dyn PipelineObserver>) -> Self {
        let broker_timeout = match config.broker_timeout {
            BrokerTimeout::Default => Some(DEFAULT_BROKER_TIMEOUT),
            other => other.duration_or(DEFAULT_BROKER_TIMEOUT),
        };
        Self {
            topics: DashMap::new(),
            trackers: DashMap::new(),
            observer,
            persist_strategy: config.persist_strategy,
            default_exec: config.commit_exec,
            broker_timeout,
            retry: CommitRetryPolicy::from_config(config),
            trace_commits: AtomicBool::new(false),
        }
    }

    /// Register the client that serves a topic's commit and metadata calls.
    pub fn register_topic(
        &self,
        topic: impl Into<String>,
        client: Arc<dyn KafkaClient>,
        auto_reset_at_end: bool,
    ) {
        self.topics.insert(
            topic.into(),
            TopicEntry {
                client,
                auto_reset_at_end,
            },
        );
    }

    /// Per-commit logging toggle. Verbose; off by default.
    pub fn set_commit_tracing(&self, enabled: bool) {
        self.trace_commits.store(enabled, Ordering::Relaxed);
    }

    fn tracing_enabled(&self) -> bool {
        self.trace_commits.load(Ordering::Relaxed)
    }

    fn client_for(&self, topic: &str) -> Result<Arc<dyn KafkaClient>> {
        self.topics
            .get(topic)
            .map(|entry| entry.client.clone())
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown topic: {topic}")))
    }

    fn tracker_for(&self, partition: &Partition) -> Result<Arc<OffsetTracker>> {
        self.trackers
            .get(partition)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                PipelineError::InvalidArgument(format!("unknown partition: {partition}"))
            })
    }

    /// Compute the concrete starting offset for an assignment request against
    /// the broker-reported committed offset and watermarks.
    pub fn resolve_start_offset(
        requested: StartOffset,
        committed: Option<i64>,
        low: i64,
        high: i64,
        auto_reset_at_end: bool,
    ) -> Result<i64> {
        match requested {
            StartOffset::Stored => match committed {
                // The topic was purged; the first available message is now
                // above the last commit.
                Some(committed) if committed < low => Ok(low),
                Some(committed) => Ok(committed),
                None => Ok(if auto_reset_at_end { high } else { low }),
            },
            StartOffset::Beginning => Ok(low),
            StartOffset::End => Ok(high),
            StartOffset::Tail(n) => Ok((high - n).clamp(low, high)),
            StartOffset::Exact(offset) if offset >= low && offset <= high => Ok(offset),
            StartOffset::Exact(offset) => Err(PipelineError::InvalidArgument(format!(
                "requested offset {offset} is outside the watermark range [{low}, {high}]"
            ))),
        }
    }

    /// Initialize trackers for a new assignment, querying committed offsets
    /// and watermarks from the broker. Returns the resolved concrete start
    /// offset per partition.
    pub async fn install_assignment(
        &self,
        assignments: &[PartitionAssignment],
    ) -> Result<Vec<PartitionOffset>> {
        let mut resolved = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let partition = assignment.partition();
            let (client, auto_reset_at_end) = {
                let entry = self.topics.get(partition.topic()).ok_or_else(|| {
                    PipelineError::InvalidArgument(format!(
                        "unknown topic: {}",
                        partition.topic()
                    ))
                })?;
                (entry.client.clone(), entry.auto_reset_at_end)
            };

            let committed = client
                .committed_offset(partition, self.broker_timeout)
                .await
                .map_err(PipelineError::from_kafka)?;
            let watermark = client
                .watermarks(partition, self.broker_timeout)
                .await
                .map_err(PipelineError::from_kafka)?;

            let start = Self::resolve_start_offset(
                assignment.start(),
                committed,
                watermark.low,
                watermark.high,
                auto_reset_at_end,
            )?;

            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                record = %json!({
                    "watermarks": watermark,
                    "committed": committed,
                    "assignment": start,
                }),
                "resolved starting offset"
            );

            self.trackers
                .insert(partition.clone(), Arc::new(OffsetTracker::new(start)));
            resolved.push(PartitionOffset::new(partition.clone(), start));
        }
        Ok(resolved)
    }

    /// Acknowledge a processed offset; if the acknowledgment extends the
    /// contiguous prefix, persist the new safe position.
    pub async fn save_offset(
        &self,
        offset: &PartitionOffset,
        exec: Option<ExecMode>,
    ) -> Result<()> {
        let tracker = self.tracker_for(offset.partition())?;
        if self.tracing_enabled() {
            debug!(
                topic = offset.topic(),
                partition = offset.partition_number(),
                offset = offset.offset(),
                "saving offset"
            );
        }
        if let Some(range) = tracker.acknowledge(offset.offset())? {
            self.persist(offset.partition(), range.last + 1, exec).await?;
        }
        Ok(())
    }

    /// Flush every partition now: jump the prefix over the lowest pending
    /// interval (if any) and persist the resulting position, even when no new
    /// acknowledgment arrived.
    pub async fn force_commit(&self, exec: Option<ExecMode>) -> Result<()> {
        let partitions: Vec<Partition> =
            self.trackers.iter().map(|e| e.key().clone()).collect();
        for partition in partitions {
            self.force_commit_partition(&partition, exec).await?;
        }
        Ok(())
    }

    /// `force_commit` for a single partition.
    pub async fn force_commit_partition(
        &self,
        partition: &Partition,
        exec: Option<ExecMode>,
    ) -> Result<()> {
        let tracker = self.tracker_for(partition)?;
        tracker.absorb_first_pending();
        self.persist(partition, tracker.current_offset() + 1, exec)
            .await
    }

    /// Persist the current safe position without touching pending intervals.
    /// With no partition given, every tracked partition is flushed.
    pub async fn force_commit_current(
        &self,
        partition: Option<&Partition>,
        exec: Option<ExecMode>,
    ) -> Result<()> {
        match partition {
            Some(partition) => {
                let tracker = self.tracker_for(partition)?;
                self.persist(partition, tracker.current_offset() + 1, exec)
                    .await
            }
            None => {
                let partitions: Vec<Partition> =
                    self.trackers.iter().map(|e| e.key().clone()).collect();
                for partition in partitions {
                    Box::pin(self.force_commit_current(Some(&partition), exec)).await?;
                }
                Ok(())
            }
        }
    }

    /// Highest offset whose whole prefix has been acknowledged.
    pub fn current_offset(&self, partition: &Partition) -> Result<i64> {
        Ok(self.tracker_for(partition)?.current_offset())
    }

    /// First offset read under this assignment; immutable, lock-free.
    pub fn begin_offset(&self, partition: &Partition) -> Result<i64> {
        Ok(self.tracker_for(partition)?.begin_offset())
    }

    /// Bounds of the acknowledged-but-uncommittable region, if any.
    pub fn uncommitted_margins(&self, partition: &Partition) -> Result<Option<(i64, i64)>> {
        Ok(self.tracker_for(partition)?.pending_margins())
    }

    /// Drop tracker state for revoked partitions. Offsets should have been
    /// force-committed beforehand.
    pub fn clear_partitions(&self, partitions: &[Partition]) {
        for partition in partitions {
            if self.trackers.remove(partition).is_some() {
                debug!(%partition, "cleared tracker for revoked partition");
            }
        }
    }

    /// Clear all trackers; with `FetchOffsets`, re-initialize each from the
    /// broker's committed position.
    pub async fn reset_partition_offsets(&self, action: ResetAction) -> Result<()> {
        let topics: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            self.reset_topic_offsets(&topic, action).await?;
        }
        Ok(())
    }

    /// `reset_partition_offsets` for one topic.
    pub async fn reset_topic_offsets(&self, topic: &str, action: ResetAction) -> Result<()> {
        let partitions: Vec<Partition> = self
            .trackers
            .iter()
            .filter(|e| e.key().topic() == topic)
            .map(|e| e.key().clone())
            .collect();
        for partition in &partitions {
            self.trackers.remove(partition);
        }
        if action == ResetAction::FetchOffsets {
            let assignments: Vec<PartitionAssignment> = partitions
                .into_iter()
                .map(|p| PartitionAssignment::new(p, StartOffset::Stored))
                .collect();
            self.install_assignment(&assignments).await?;
        }
        Ok(())
    }

    pub(crate) fn tracked_partitions(&self) -> Vec<Partition> {
        self.trackers.iter().map(|e| e.key().clone()).collect()
    }

    /// JSON document describing every tracked partition: begin, current and
    /// the pending intervals above the committable prefix.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut topics: Vec<serde_json::Value> = Vec::new();
        for entry in self.topics.iter() {
            let topic = entry.key();
            let mut partitions: Vec<serde_json::Value> = self
                .trackers
                .iter()
                .filter(|e| e.key().topic() == topic)
                .map(|e| {
                    let snapshot = e.value().snapshot();
                    json!({
                        "partition": e.key().partition_number(),
                        "begin": snapshot.begin,
                        "current": snapshot.current,
                        "intervals": snapshot.intervals,
                    })
                })
                .collect();
            partitions.sort_by_key(|p| p["partition"].as_i64());
            topics.push(json!({
                "name": topic,
                "partitions": partitions,
                "resetAtEnd": entry.value().auto_reset_at_end,
            }));
        }
        json!({ "offsetManager": topics })
    }

    /// Persist `next_offset` (the next offset to consume) for a partition via
    /// the configured strategy.
    async fn persist(
        &self,
        partition: &Partition,
        next_offset: i64,
        exec: Option<ExecMode>,
    ) -> Result<()> {
        let client = self.client_for(partition.topic())?;
        let target = PartitionOffset::new(partition.clone(), next_offset);

        if self.tracing_enabled() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = next_offset,
                "persisting offset"
            );
        }
        metrics::gauge!(CURRENT_OFFSET,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string()
        )
        .set((next_offset - 1) as f64);

        match self.persist_strategy {
            PersistStrategy::Store => {
                client
                    .store(std::slice::from_ref(&target))
                    .map_err(PipelineError::from_kafka)?;
                metrics::counter!(OFFSETS_STORED).increment(1);
                self.observer.on_commit(partition, next_offset);
                Ok(())
            }
            PersistStrategy::Commit => match exec.unwrap_or(self.default_exec) {
                ExecMode::Sync => {
                    commit_with_retry(
                        client,
                        self.retry.clone(),
                        self.observer.clone(),
                        target,
                    )
                    .await
                }
                ExecMode::Async => {
                    let retry = self.retry.clone();
                    let observer = self.observer.clone();
                    tokio::spawn(async move {
                        // Errors surface through the observer after the retry
                        // envelope is exhausted.
                        let _ = commit_with_retry(client, retry, observer, target).await;
                    });
                    Ok(())
                }
            },
        }
    }
}

/// Commit one offset, retrying transient broker errors under the backoff
/// policy. The final failure is reported through the observer and returned.
async fn commit_with_retry(
    client: Arc<dyn KafkaClient>,
    retry: CommitRetryPolicy,
    observer: Arc<dyn PipelineObserver>,
    target: PartitionOffset,
) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        match client.commit(std::slice::from_ref(&target)).await {
            Ok(()) => {
                metrics::counter!(COMMITS).increment(1);
                observer.on_commit(target.partition(), target.offset());
                return Ok(());
            }
            Err(e) => {
                let err = PipelineError::from_kafka(e);
                if err.is_retryable() && attempt < retry.retries() {
                    attempt += 1;
                    metrics::counter!(COMMIT_RETRIES).increment(1);
                    warn!(
                        topic = target.topic(),
                        partition = target.partition_number(),
                        offset = target.offset(),
                        attempt,
                        error = %err,
                        "commit failed, retrying"
                    );
                    sleep(retry.delay(attempt)).await;
                } else {
                    metrics::counter!(COMMIT_FAILURES).increment(1);
                    observer.on_error(&err);
                    return Err(err);
                }
            }
        }
    }
}

impl fmt::Display for OffsetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.snapshot())
    }
}
