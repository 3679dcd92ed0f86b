use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::{FetchEvent, KafkaClient};
use crate::config::{PipelineConfig, PollStrategy};
use crate::dispatcher::Dispatcher;
use crate::error::PipelineError;
use crate::message::{MessageParser, MessageReceiver, RawMessage};
use crate::metrics_consts::{FETCH_ERRORS, PARTITION_EOF, POLL_BACKPRESSURE};
use crate::observer::PipelineObserver;
use crate::partition::{AssignmentPhase, PartitionState};
use crate::types::Partition;

type FetchedBatch = (Vec<FetchEvent>, Option<rdkafka::error::KafkaError>);

/// Where a fetched message should go, given its partition's current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Dispatch,
    /// Paused partition, or an active one with held messages ahead of this
    /// offset: keep it back so per-partition order survives a pause window.
    Hold,
    /// Revoking or unassigned: the broker redelivers from the committed
    /// offset on the next assignment.
    Discard,
}

/// Pulls batches from the underlying client and feeds the dispatcher with
/// partition affinity.
///
/// `Serial` emits messages in broker order; `Batch` groups one read's worth of
/// messages by partition so partitions dispatch in parallel; `RoundRobin`
/// drains per-partition queues one message at a time so a single hot
/// partition cannot starve the others.
pub(crate) struct Poller<M, R>
where
    M: MessageParser,
    R: MessageReceiver<M::Key, M::Payload>,
{
    topic: String,
    client: Arc<dyn KafkaClient>,
    dispatcher: Arc<Dispatcher<M, R>>,
    states: Arc<DashMap<Partition, Arc<PartitionState>>>,
    observer: Arc<dyn PipelineObserver>,
    strategy: PollStrategy,
    read_budget: usize,
    poll_wait: Duration,
    min_poll_interval: Duration,
    batch_prefetch: bool,
    backpressure_multiplier: u32,
    shutdown: watch::Receiver<bool>,
    /// Messages that arrived for paused partitions, replayed in order on
    /// resume. The client is also paused at the source, so this only holds
    /// what was already in flight when the pause landed.
    held: HashMap<Partition, VecDeque<RawMessage>>,
}

impl<M, R> Poller<M, R>
where
    M: MessageParser,
    R: MessageReceiver<M::Key, M::Payload>,
{
    pub(crate) fn new(
        config: &PipelineConfig,
        topic: impl Into<String>,
        client: Arc<dyn KafkaClient>,
        dispatcher: Arc<Dispatcher<M, R>>,
        states: Arc<DashMap<Partition, Arc<PartitionState>>>,
        observer: Arc<dyn PipelineObserver>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let read_budget = if config.read_size < 0 {
            usize::MAX
        } else {
            config.read_size as usize
        };
        Self {
            topic: topic.into(),
            client,
            dispatcher,
            states,
            observer,
            strategy: config.poll_strategy,
            read_budget,
            poll_wait: config.poll_wait(),
            min_poll_interval: config.min_poll_interval,
            batch_prefetch: config.batch_prefetch,
            backpressure_multiplier: if config.auto_throttle {
                config.auto_throttle_multiplier
            } else {
                1
            },
            shutdown,
            held: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        info!(strategy = ?self.strategy, "poller started");
        match self.strategy {
            PollStrategy::Serial => self.run_serial().await,
            PollStrategy::Batch => self.run_batch().await,
            PollStrategy::RoundRobin => self.run_round_robin().await,
        }
        info!("poller stopped");
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn partition_phase(&self, partition: &Partition) -> Option<AssignmentPhase> {
        self.states.get(partition).map(|state| state.phase())
    }

    fn classify(&self, partition: &Partition) -> Route {
        match self.partition_phase(partition) {
            Some(AssignmentPhase::Assigned) => {
                if self.held.get(partition).is_some_and(|held| !held.is_empty()) {
                    Route::Hold
                } else {
                    Route::Dispatch
                }
            }
            Some(AssignmentPhase::Paused) => Route::Hold,
            _ => Route::Discard,
        }
    }

    fn hold(&mut self, raw: RawMessage) {
        let partition = raw.partition().clone();
        debug!(%partition, offset = raw.offset(), "holding message until the partition resumes");
        self.held.entry(partition).or_default().push_back(raw);
    }

    fn all_known_paused(&self) -> bool {
        let mut known = false;
        for entry in self.states.iter() {
            if entry.key().topic() != self.topic {
                continue;
            }
            known = true;
            if !entry.value().is_paused() {
                return false;
            }
        }
        known
    }

    /// Pause is honoured before fetching: when every known partition of this
    /// topic is paused there is nothing to poll for, so skip the fetch
    /// entirely. Returns true when the fetch was skipped.
    async fn pause_gate(&self) -> bool {
        if self.all_known_paused() {
            sleep(self.min_poll_interval).await;
            return true;
        }
        false
    }

    /// Replay held messages for partitions that became active again, oldest
    /// first, before anything newly fetched.
    async fn replay_resumed(&mut self) {
        let partitions: Vec<Partition> = self.held.keys().cloned().collect();
        for partition in partitions {
            match self.partition_phase(&partition) {
                Some(AssignmentPhase::Paused) => continue,
                Some(AssignmentPhase::Assigned) => {}
                _ => {
                    // Revoked while held; the next assignee re-reads these.
                    self.held.remove(&partition);
                    continue;
                }
            }
            while let Some(raw) = self
                .held
                .get_mut(&partition)
                .and_then(VecDeque::pop_front)
            {
                let permit = if self.strategy == PollStrategy::RoundRobin {
                    None
                } else {
                    match self.dispatcher.reserve(self.poll_wait).await {
                        Some(permit) => Some(permit),
                        None => {
                            // Out of budget; put it back and retry next round.
                            if let Some(held) = self.held.get_mut(&partition) {
                                held.push_front(raw);
                            }
                            self.backpressure_pause().await;
                            return;
                        }
                    }
                };
                self.dispatcher.dispatch(raw, permit).await;
            }
            self.held.remove(&partition);
        }
    }

    async fn run_serial(&mut self) {
        while !self.shutting_down() {
            self.replay_resumed().await;
            if self.pause_gate().await {
                continue;
            }
            let Some(permit) = self.dispatcher.reserve(self.poll_wait).await else {
                self.backpressure_pause().await;
                continue;
            };
            match self.client.fetch(self.poll_wait).await {
                Ok(FetchEvent::Message(message)) => {
                    let raw = RawMessage::from_owned(&message);
                    match self.classify(raw.partition()) {
                        Route::Dispatch => self.dispatcher.dispatch(raw, Some(permit)).await,
                        Route::Hold => self.hold(raw),
                        Route::Discard => {
                            debug!(partition = %raw.partition(), "dropping message for inactive partition");
                        }
                    }
                }
                Ok(FetchEvent::PartitionEof(partition)) => self.handle_eof(&partition),
                Ok(FetchEvent::Idle) => {}
                Err(e) => self.handle_fetch_error(e).await,
            }
        }
    }

    async fn run_batch(&mut self) {
        let mut prefetch: Option<JoinHandle<FetchedBatch>> = None;
        while !self.shutting_down() {
            self.replay_resumed().await;
            if prefetch.is_none() && self.pause_gate().await {
                continue;
            }
            let (events, fetch_error) = match prefetch.take() {
                Some(handle) => handle.await.unwrap_or_default(),
                None => {
                    collect_events(
                        self.client.clone(),
                        self.read_budget,
                        self.poll_wait,
                        self.min_poll_interval,
                    )
                    .await
                }
            };
            if let Some(e) = fetch_error {
                self.handle_fetch_error(e).await;
            }

            // Overlap the next fetch with dispatching the current batch.
            // Not while paused: the gate must see the pause before any
            // further fetch is issued.
            if self.batch_prefetch && !self.shutting_down() && !self.all_known_paused() {
                prefetch = Some(tokio::spawn(collect_events(
                    self.client.clone(),
                    self.read_budget,
                    self.poll_wait,
                    self.min_poll_interval,
                )));
            }

            let mut groups: HashMap<Partition, Vec<RawMessage>> = HashMap::new();
            for event in events {
                match event {
                    FetchEvent::Message(message) => {
                        let raw = RawMessage::from_owned(&message);
                        groups.entry(raw.partition().clone()).or_default().push(raw);
                    }
                    FetchEvent::PartitionEof(partition) => self.handle_eof(&partition),
                    FetchEvent::Idle => {}
                }
            }

            for (partition, messages) in groups {
                match self.classify(&partition) {
                    Route::Discard => {
                        debug!(%partition, "dropping sub-batch for inactive partition");
                    }
                    Route::Hold => {
                        for raw in messages {
                            self.hold(raw);
                        }
                    }
                    Route::Dispatch => {
                        for raw in messages {
                            let permit = loop {
                                if self.shutting_down() {
                                    return;
                                }
                                match self.dispatcher.reserve(self.poll_wait).await {
                                    Some(permit) => break permit,
                                    None => self.backpressure_pause().await,
                                }
                            };
                            self.dispatcher.dispatch(raw, Some(permit)).await;
                        }
                    }
                }
            }
        }
    }

    async fn run_round_robin(&mut self) {
        let mut queues: HashMap<Partition, VecDeque<RawMessage>> = HashMap::new();
        let mut rotation: VecDeque<Partition> = VecDeque::new();

        while !self.shutting_down() {
            if self.pause_gate().await {
                continue;
            }
            // Fill: drain whatever the client has buffered right now.
            let (events, fetch_error) = collect_events(
                self.client.clone(),
                self.read_budget,
                self.min_poll_interval,
                self.min_poll_interval,
            )
            .await;
            if let Some(e) = fetch_error {
                self.handle_fetch_error(e).await;
            }
            for event in events {
                match event {
                    FetchEvent::Message(message) => {
                        let raw = RawMessage::from_owned(&message);
                        let partition = raw.partition().clone();
                        if !queues.contains_key(&partition) {
                            rotation.push_back(partition.clone());
                        }
                        queues.entry(partition).or_default().push_back(raw);
                    }
                    FetchEvent::PartitionEof(partition) => self.handle_eof(&partition),
                    FetchEvent::Idle => {}
                }
            }

            // One rotation: at most one message from each partition in turn,
            // so a single hot partition cannot starve the rest. The queues
            // double as the pause buffer: a paused partition keeps its
            // messages until resume, a revoked one forfeits them.
            let mut emitted = false;
            for _ in 0..rotation.len() {
                let Some(partition) = rotation.pop_front() else {
                    break;
                };
                rotation.push_back(partition.clone());
                match self.partition_phase(&partition) {
                    Some(AssignmentPhase::Assigned) => {
                        if let Some(raw) =
                            queues.get_mut(&partition).and_then(VecDeque::pop_front)
                        {
                            self.dispatcher.dispatch(raw, None).await;
                            emitted = true;
                        }
                    }
                    Some(AssignmentPhase::Paused) => {}
                    _ => {
                        if let Some(held) = queues.get_mut(&partition) {
                            if !held.is_empty() {
                                debug!(%partition, count = held.len(), "discarding messages for revoked partition");
                                held.clear();
                            }
                        }
                    }
                }
            }

            if !emitted {
                sleep(self.min_poll_interval).await;
            }
        }
    }

    fn handle_eof(&self, partition: &Partition) {
        let first = self
            .states
            .get(partition)
            .map(|state| state.mark_eof())
            .unwrap_or(false);
        if first {
            info!(%partition, "partition reached high watermark");
            metrics::counter!(PARTITION_EOF,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
            self.observer.on_partition_eof(partition);
        }
    }

    async fn handle_fetch_error(&self, error: rdkafka::error::KafkaError) {
        metrics::counter!(FETCH_ERRORS).increment(1);
        let error = PipelineError::from_kafka(error);
        warn!(topic = %self.topic, error = %error, "fetch failed");
        self.observer.on_error(&error);
        if matches!(error, PipelineError::BrokerFatal(_)) {
            // Non-recoverable: stop feeding this topic's partitions.
            for entry in self.states.iter() {
                if entry.key().topic() == self.topic {
                    entry.value().set_phase(AssignmentPhase::Revoking);
                }
            }
            return;
        }
        // Transient; back off briefly, reconnects are the client's job.
        sleep(self.min_poll_interval).await;
    }

    /// The dispatcher's in-flight budget is exhausted; wait before polling
    /// again. Auto-throttle stretches the pause.
    async fn backpressure_pause(&self) {
        metrics::counter!(POLL_BACKPRESSURE).increment(1);
        if self.backpressure_multiplier > 1 {
            sleep(self.poll_wait * (self.backpressure_multiplier - 1)).await;
        }
    }
}

/// Fetch up to `max` messages, stopping early once the source goes idle or
/// fails. A fetch error ends the batch and is returned alongside it.
async fn collect_events(
    client: Arc<dyn KafkaClient>,
    max: usize,
    first_wait: Duration,
    next_wait: Duration,
) -> (Vec<FetchEvent>, Option<rdkafka::error::KafkaError>) {
    let mut events = Vec::new();
    let mut messages = 0usize;
    let mut wait = first_wait;
    while messages < max {
        match client.fetch(wait).await {
            Ok(FetchEvent::Idle) => break,
            Ok(event) => {
                if matches!(event, FetchEvent::Message(_)) {
                    messages += 1;
                }
                events.push(event);
                // After the first event, drain what is already buffered.
                wait = next_wait;
            }
            Err(e) => return (events, Some(e)),
        }
    }
    (events, None)
}
