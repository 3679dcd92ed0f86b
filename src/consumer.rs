use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::{KafkaClient, RebalanceEvent};
use crate::config::{ExecMode, PipelineConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{PipelineError, Result};
use crate::message::{MessageParser, MessageReceiver, Preprocessor};
use crate::observer::{NoopObserver, PipelineObserver};
use crate::offsets::OffsetManager;
use crate::partition::{AssignmentPhase, PartitionState};
use crate::poller::Poller;
use crate::types::{OffsetWatermark, Partition, PartitionAssignment};

/// Broker-side view of one managed partition, as returned by
/// [`ConsumerManager::metadata`].
#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub partition: i32,
    pub watermark: OffsetWatermark,
    pub committed: Option<i64>,
    pub eof_seen: bool,
}

#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub topic: String,
    pub partitions: Vec<PartitionMetadata>,
}

struct TopicRuntime {
    client: Arc<dyn KafkaClient>,
    paused: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Top-level consumer lifecycle: wires assignment and revocation into the
/// offset manager and dispatcher, owns the pollers, and fans out across
/// topics (one underlying client per topic).
pub struct ConsumerManager<M, R>
where
    M: MessageParser,
    R: MessageReceiver<M::Key, M::Payload>,
{
    config: PipelineConfig,
    observer: Arc<dyn PipelineObserver>,
    offset_manager: Arc<OffsetManager>,
    dispatcher: Arc<Dispatcher<M, R>>,
    states: Arc<DashMap<Partition, Arc<PartitionState>>>,
    topics: DashMap<String, Arc<TopicRuntime>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<M, R> ConsumerManager<M, R>
where
    M: MessageParser,
    R: MessageReceiver<M::Key, M::Payload>,
{
    pub fn new(config: PipelineConfig, parser: M, receiver: R) -> Self {
        Self::with_hooks(config, parser, receiver, None, Arc::new(NoopObserver))
    }

    pub fn with_hooks(
        config: PipelineConfig,
        parser: M,
        receiver: R,
        preprocessor: Option<Arc<dyn Preprocessor>>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        let offset_manager = Arc::new(OffsetManager::new(&config, observer.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            Arc::new(parser),
            Arc::new(receiver),
            preprocessor,
            offset_manager.clone(),
            observer.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            observer,
            offset_manager,
            dispatcher,
            states: Arc::new(DashMap::new()),
            topics: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register a topic and the client that serves it. Topics must be added
    /// before `start`.
    pub fn add_topic(&self, topic: impl Into<String>, client: Arc<dyn KafkaClient>) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(PipelineError::InvalidArgument(
                "topics must be added before start".to_string(),
            ));
        }
        let topic = topic.into();
        self.offset_manager
            .register_topic(&topic, client.clone(), self.config.auto_reset_at_end);
        self.topics.insert(
            topic,
            Arc::new(TopicRuntime {
                client,
                paused: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        );
        Ok(())
    }

    /// Subscribe every registered topic and start its poller and rebalance
    /// worker.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("consumer manager already started");
            return Ok(());
        }
        for entry in self.topics.iter() {
            let topic = entry.key().clone();
            let runtime = entry.value().clone();

            let rebalance_rx = runtime.client.take_rebalance_events().ok_or_else(|| {
                PipelineError::InvalidArgument(format!(
                    "rebalance events for topic {topic} already consumed"
                ))
            })?;

            let mut tasks = runtime.tasks.lock().unwrap();
            tasks.push(tokio::spawn(Self::rebalance_worker(
                topic.clone(),
                rebalance_rx,
                runtime.clone(),
                self.offset_manager.clone(),
                self.dispatcher.clone(),
                self.states.clone(),
                self.observer.clone(),
                self.config.clone(),
                self.shutdown_rx.clone(),
            )));
            tasks.push(tokio::spawn(
                Poller::new(
                    &self.config,
                    topic.clone(),
                    runtime.client.clone(),
                    self.dispatcher.clone(),
                    self.states.clone(),
                    self.observer.clone(),
                    self.shutdown_rx.clone(),
                )
                .run(),
            ));

            runtime
                .client
                .subscribe(&topic)
                .map_err(PipelineError::from_kafka)?;
            info!(%topic, "consumer started");
        }
        Ok(())
    }

    /// Statically assign partitions at explicit starting positions instead of
    /// (or in addition to) group subscription.
    pub async fn assign_partitions(
        &self,
        topic: &str,
        assignments: Vec<PartitionAssignment>,
    ) -> Result<()> {
        let runtime = self.runtime(topic)?;
        let resolved = self.offset_manager.install_assignment(&assignments).await?;
        self.install_states(&assignments, runtime.paused.load(Ordering::SeqCst));
        runtime
            .client
            .assign(&resolved)
            .map_err(PipelineError::from_kafka)?;
        if self.config.pause_on_start || runtime.paused.load(Ordering::SeqCst) {
            let partitions: Vec<Partition> = assignments
                .iter()
                .map(|a| a.partition().clone())
                .collect();
            runtime
                .client
                .pause(&partitions)
                .map_err(PipelineError::from_kafka)?;
        }
        Ok(())
    }

    /// Stop fetching from every partition of a topic until `resume`.
    pub async fn pause(&self, topic: &str) -> Result<()> {
        let runtime = self.runtime(topic)?;
        runtime.paused.store(true, Ordering::SeqCst);
        let partitions = self.topic_partitions(topic);
        for partition in &partitions {
            if let Some(state) = self.states.get(partition) {
                if state.phase() == AssignmentPhase::Assigned {
                    state.set_phase(AssignmentPhase::Paused);
                }
            }
        }
        runtime
            .client
            .pause(&partitions)
            .map_err(PipelineError::from_kafka)
    }

    pub async fn resume(&self, topic: &str) -> Result<()> {
        let runtime = self.runtime(topic)?;
        runtime.paused.store(false, Ordering::SeqCst);
        let partitions = self.topic_partitions(topic);
        for partition in &partitions {
            if let Some(state) = self.states.get(partition) {
                if state.phase() == AssignmentPhase::Paused {
                    state.set_phase(AssignmentPhase::Assigned);
                }
            }
        }
        runtime
            .client
            .resume(&partitions)
            .map_err(PipelineError::from_kafka)
    }

    /// Watermarks and committed offsets for every partition of a managed
    /// topic, bounded by the configured broker timeout.
    pub async fn metadata(&self, topic: &str) -> Result<TopicMetadata> {
        let runtime = self.runtime(topic)?;
        let timeout = self
            .config
            .broker_timeout
            .duration_or(std::time::Duration::from_secs(30));
        let mut partitions = Vec::new();
        for partition in self.topic_partitions(topic) {
            let watermark = runtime
                .client
                .watermarks(&partition, timeout)
                .await
                .map_err(PipelineError::from_kafka)?;
            let committed = runtime
                .client
                .committed_offset(&partition, timeout)
                .await
                .map_err(PipelineError::from_kafka)?;
            let eof_seen = self
                .states
                .get(&partition)
                .map(|state| state.eof_seen())
                .unwrap_or(false);
            partitions.push(PartitionMetadata {
                partition: partition.partition_number(),
                watermark,
                committed,
                eof_seen,
            });
        }
        partitions.sort_by_key(|p| p.partition);
        Ok(TopicMetadata {
            topic: topic.to_string(),
            partitions,
        })
    }

    /// The configuration in effect for a managed topic.
    pub fn configuration(&self, topic: &str) -> Result<&PipelineConfig> {
        if !self.topics.contains_key(topic) {
            return Err(PipelineError::InvalidArgument(format!(
                "unknown topic: {topic}"
            )));
        }
        Ok(&self.config)
    }

    pub fn offset_manager(&self) -> &Arc<OffsetManager> {
        &self.offset_manager
    }

    /// Partition lifecycle phase, if the partition is currently tracked.
    pub fn partition_phase(&self, partition: &Partition) -> Option<AssignmentPhase> {
        self.states.get(partition).map(|state| state.phase())
    }

    pub fn partition_eof_seen(&self, partition: &Partition) -> bool {
        self.states
            .get(partition)
            .map(|state| state.eof_seen())
            .unwrap_or(false)
    }

    /// Graceful, idempotent shutdown: stop polling, mark partitions revoking,
    /// let in-flight receivers finish, then flush the final safe offsets
    /// synchronously and release resources.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down consumer manager");
        for entry in self.states.iter() {
            entry.value().set_phase(AssignmentPhase::Revoking);
        }
        let _ = self.shutdown_tx.send(true);

        self.dispatcher.drain(None).await;
        if let Err(e) = self
            .offset_manager
            .force_commit(Some(ExecMode::Sync))
            .await
        {
            error!(error = %e, "final commit failed during shutdown");
            self.observer.on_error(&e);
        }
        self.dispatcher.shutdown().await;

        let runtimes: Vec<(String, Arc<TopicRuntime>)> = self
            .topics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (topic, runtime) in runtimes {
            if let Err(e) = runtime.client.unassign() {
                warn!(%topic, error = %e, "unassign failed");
            }
            let tasks: Vec<JoinHandle<()>> = runtime.tasks.lock().unwrap().drain(..).collect();
            for task in tasks {
                let _ = task.await;
            }
        }

        let tracked = self.offset_manager.tracked_partitions();
        self.offset_manager.clear_partitions(&tracked);
        self.states.clear();
        info!("consumer manager shut down");
    }

    fn runtime(&self, topic: &str) -> Result<Arc<TopicRuntime>> {
        self.topics
            .get(topic)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown topic: {topic}")))
    }

    fn topic_partitions(&self, topic: &str) -> Vec<Partition> {
        self.states
            .iter()
            .filter(|entry| entry.key().topic() == topic)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn install_states(&self, assignments: &[PartitionAssignment], topic_paused: bool) {
        let paused = self.config.pause_on_start || topic_paused;
        for assignment in assignments {
            self.states.insert(
                assignment.partition().clone(),
                Arc::new(PartitionState::new(paused, self.config.auto_reset_at_end)),
            );
        }
    }

    /// Reacts to rebalance events forwarded from the client's callback
    /// thread. Assignment initializes trackers from broker state; revocation
    /// fences the partitions, drains in-flight work, flushes the final safe
    /// offsets synchronously, and clears tracker state.
    #[allow(clippy::too_many_arguments)]
    async fn rebalance_worker(
        topic: String,
        mut events: mpsc::UnboundedReceiver<RebalanceEvent>,
        runtime: Arc<TopicRuntime>,
        offset_manager: Arc<OffsetManager>,
        dispatcher: Arc<Dispatcher<M, R>>,
        states: Arc<DashMap<Partition, Arc<PartitionState>>>,
        observer: Arc<dyn PipelineObserver>,
        config: PipelineConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                RebalanceEvent::Assigned(assignments) => {
                    info!(%topic, count = assignments.len(), "handling assignment");
                    match offset_manager.install_assignment(&assignments).await {
                        Ok(_) => {
                            let topic_paused = runtime.paused.load(Ordering::SeqCst);
                            let paused = config.pause_on_start || topic_paused;
                            let partitions: Vec<Partition> = assignments
                                .iter()
                                .map(|a| a.partition().clone())
                                .collect();
                            for partition in &partitions {
                                states.insert(
                                    partition.clone(),
                                    Arc::new(PartitionState::new(
                                        paused,
                                        config.auto_reset_at_end,
                                    )),
                                );
                            }
                            if paused {
                                if let Err(e) = runtime.client.pause(&partitions) {
                                    warn!(%topic, error = %e, "pause after assignment failed");
                                }
                            }
                        }
                        Err(e) => {
                            error!(%topic, error = %e, "assignment handling failed");
                            observer.on_error(&e);
                        }
                    }
                }
                RebalanceEvent::Revoked(partitions) => {
                    info!(%topic, count = partitions.len(), "handling revocation");
                    for partition in &partitions {
                        if let Some(state) = states.get(partition) {
                            state.set_phase(AssignmentPhase::Revoking);
                        }
                    }
                    // Let in-flight receivers finish before the final flush.
                    dispatcher.drain(Some(&partitions)).await;
                    for partition in &partitions {
                        if let Err(e) = offset_manager
                            .force_commit_partition(partition, Some(ExecMode::Sync))
                            .await
                        {
                            error!(%topic, %partition, error = %e, "revocation commit failed");
                            observer.on_error(&e);
                        }
                    }
                    offset_manager.clear_partitions(&partitions);
                    for partition in &partitions {
                        states.remove(partition);
                    }
                }
                RebalanceEvent::Error(e) => {
                    let err = PipelineError::from_kafka(e);
                    error!(%topic, error = %err, "rebalance error");
                    observer.on_error(&err);
                }
            }
        }
        info!(%topic, "rebalance worker stopped");
    }
}
