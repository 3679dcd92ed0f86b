use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{ExecMode, InvokeThread, PipelineConfig};
use crate::error::PipelineError;
use crate::message::{
    spawn_persist_worker, CommitGuard, MessageParser, MessageReceiver, PersistRequest,
    PreprocessOutcome, Preprocessor, RawMessage, ReceivedMessage,
};
use crate::metrics_consts::{
    DECODE_FAILURES, MESSAGES_IN_FLIGHT, MESSAGES_RECEIVED, MESSAGES_SKIPPED,
    PREPROCESSOR_FAILURES, RECEIVER_FAILURES,
};
use crate::observer::PipelineObserver;
use crate::offsets::OffsetManager;
use crate::types::{Partition, PartitionOffset};

/// Queue depth per dispatch worker.
const WORKER_CHANNEL_CAPACITY: usize = 16;

type WorkItem = (RawMessage, Option<OwnedSemaphorePermit>);

/// In-flight message accounting, globally and per partition. Drain paths poll
/// these counters until they reach zero.
#[derive(Default)]
struct InFlight {
    global: AtomicUsize,
    per_partition: DashMap<Partition, Arc<AtomicUsize>>,
}

impl InFlight {
    fn enter(&self, partition: &Partition) {
        self.global.fetch_add(1, Ordering::SeqCst);
        self.per_partition
            .entry(partition.clone())
            .or_default()
            .fetch_add(1, Ordering::SeqCst);
        metrics::gauge!(MESSAGES_IN_FLIGHT).increment(1.0);
    }

    fn exit(&self, partition: &Partition) {
        self.global.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self.per_partition.get(partition) {
            count.fetch_sub(1, Ordering::SeqCst);
        }
        metrics::gauge!(MESSAGES_IN_FLIGHT).decrement(1.0);
    }

    fn count(&self) -> usize {
        self.global.load(Ordering::SeqCst)
    }

    fn partition_count(&self, partition: &Partition) -> usize {
        self.per_partition
            .get(partition)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// The delivery path shared by every dispatch worker: preprocess, decode,
/// invoke the receiver, then settle the offset disposition.
struct DispatchCore<M, R>
where
    M: MessageParser,
    R: MessageReceiver<M::Key, M::Payload>,
{
    parser: Arc<M>,
    receiver: Arc<R>,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    manager: Arc<OffsetManager>,
    observer: Arc<dyn PipelineObserver>,
    in_flight: Arc<InFlight>,
    /// Channel to the persist worker that applies guard-drop persists.
    ack_tx: mpsc::UnboundedSender<PersistRequest>,
    auto_persist: bool,
    persist_on_exception: bool,
    preprocess_enabled: bool,
}

impl<M, R> DispatchCore<M, R>
where
    M: MessageParser,
    R: MessageReceiver<M::Key, M::Payload>,
{
    async fn deliver(&self, raw: RawMessage, permit: Option<OwnedSemaphorePermit>) {
        let partition = raw.partition().clone();
        let offset = raw.offset();
        metrics::counter!(MESSAGES_RECEIVED,
            "topic" => partition.topic().to_string()
        )
        .increment(1);

        if self.preprocess_enabled {
            if let Some(preprocessor) = &self.preprocessor {
                match preprocessor.preprocess(&raw) {
                    PreprocessOutcome::Keep => {}
                    PreprocessOutcome::Skip => {
                        metrics::counter!(MESSAGES_SKIPPED).increment(1);
                        // Intentionally filtered; the offset still advances.
                        self.acknowledge(&partition, offset).await;
                        self.in_flight.exit(&partition);
                        return;
                    }
                    PreprocessOutcome::Fail(reason) => {
                        metrics::counter!(PREPROCESSOR_FAILURES).increment(1);
                        self.observer.on_error(&PipelineError::Preprocessor {
                            partition: partition.clone(),
                            offset,
                            reason,
                        });
                        if self.auto_persist && self.persist_on_exception {
                            self.acknowledge(&partition, offset).await;
                        }
                        self.in_flight.exit(&partition);
                        return;
                    }
                }
            }
        }

        let decoded = match self.parser.parse(&raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                metrics::counter!(DECODE_FAILURES).increment(1);
                self.observer.on_error(&PipelineError::Decode {
                    partition: partition.clone(),
                    offset,
                    reason: format!("{e:#}"),
                });
                if self.auto_persist && self.persist_on_exception {
                    self.acknowledge(&partition, offset).await;
                }
                self.in_flight.exit(&partition);
                return;
            }
        };

        let (guard, guard_state) = CommitGuard::new(
            self.manager.clone(),
            partition.clone(),
            offset,
            self.auto_persist,
            self.persist_on_exception,
            self.ack_tx.clone(),
            permit,
        );
        let message = ReceivedMessage::new(
            partition.clone(),
            offset,
            raw.timestamp(),
            decoded.key,
            decoded.payload,
            raw.headers,
        );

        let failed = match self.receiver.receive(message, guard).await {
            Ok(()) => false,
            Err(e) => {
                metrics::counter!(RECEIVER_FAILURES).increment(1);
                self.observer.on_error(&PipelineError::Receiver {
                    partition: partition.clone(),
                    offset,
                    reason: format!("{e:#}"),
                });
                true
            }
        };

        // The guard owns the persist decision; this side only reports the
        // outcome and applies a persist the guard's drop already decided.
        if guard_state.settle_outcome(failed) {
            self.acknowledge(&partition, offset).await;
        }

        self.in_flight.exit(&partition);
    }

    async fn acknowledge(&self, partition: &Partition, offset: i64) {
        if let Err(err) = self
            .manager
            .save_offset(&PartitionOffset::new(partition.clone(), offset), None)
            .await
        {
            self.observer.on_error(&err);
        }
    }
}

/// Delivers decoded messages to the receiver under the configured ordering,
/// threading and execution policies.
///
/// Ordering: with `preserve.message.order` each partition gets a serial
/// worker, so at most one receiver invocation per partition is in flight and
/// offsets are observed in order. Threading: `io` routes unordered work onto a
/// fixed pool with partition-pinned placement; `coro` spawns a cooperative
/// task per message. Execution: `sync` awaits every delivery before the next
/// message is pulled.
pub(crate) struct Dispatcher<M, R>
where
    M: MessageParser,
    R: MessageReceiver<M::Key, M::Payload>,
{
    core: Arc<DispatchCore<M, R>>,
    budget: Arc<Semaphore>,
    exec: ExecMode,
    preserve_order: bool,
    invoke_thread: InvokeThread,
    partition_workers: DashMap<Partition, mpsc::Sender<WorkItem>>,
    pool: Mutex<Vec<mpsc::Sender<WorkItem>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<M, R> Dispatcher<M, R>
where
    M: MessageParser,
    R: MessageReceiver<M::Key, M::Payload>,
{
    pub(crate) fn new(
        config: &PipelineConfig,
        parser: Arc<M>,
        receiver: Arc<R>,
        preprocessor: Option<Arc<dyn Preprocessor>>,
        manager: Arc<OffsetManager>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        let ack_tx = spawn_persist_worker(manager.clone(), observer.clone());
        let core = Arc::new(DispatchCore {
            parser,
            receiver,
            preprocessor,
            manager,
            observer,
            in_flight: Arc::new(InFlight::default()),
            ack_tx,
            auto_persist: config.auto_offset_persist,
            persist_on_exception: config.auto_persist_on_exception,
            preprocess_enabled: config.preprocess_messages,
        });

        let dispatcher = Self {
            core,
            budget: Arc::new(Semaphore::new(config.in_flight_budget())),
            exec: config.receive_callback_exec,
            preserve_order: config.preserve_message_order,
            invoke_thread: config.receive_invoke_thread,
            partition_workers: DashMap::new(),
            pool: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        };

        // The io pool exists only for unordered dispatch; ordered dispatch
        // pins each partition to its own serial worker instead.
        if dispatcher.invoke_thread == InvokeThread::Io && !dispatcher.preserve_order {
            let mut pool = dispatcher.pool.lock().unwrap();
            let mut handles = dispatcher.handles.lock().unwrap();
            for index in config.thread_range_low..=config.thread_range_high {
                let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
                handles.push(spawn_worker(dispatcher.core.clone(), rx, index));
                pool.push(tx);
            }
        }

        dispatcher
    }

    /// Reserve one slot of the in-flight budget, waiting at most `timeout`.
    /// `None` means the budget is exhausted and the poller should back off.
    pub(crate) async fn reserve(&self, timeout: Duration) -> Option<OwnedSemaphorePermit> {
        match tokio::time::timeout(timeout, self.budget.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            _ => None,
        }
    }

    /// Route one message to the receiver according to policy.
    pub(crate) async fn dispatch(&self, raw: RawMessage, permit: Option<OwnedSemaphorePermit>) {
        let partition = raw.partition().clone();
        self.core.in_flight.enter(&partition);

        if self.exec == ExecMode::Sync {
            // Await the delivery before the caller pulls the next message.
            self.core.deliver(raw, permit).await;
            return;
        }

        if self.preserve_order {
            let sender = self.partition_worker(&partition);
            if sender.send((raw, permit)).await.is_err() {
                warn!(%partition, "dispatch worker stopped; dropping message");
                self.core.observer.on_error(&PipelineError::Cancelled);
                self.core.in_flight.exit(&partition);
            }
            return;
        }

        match self.invoke_thread {
            InvokeThread::Coro => {
                let core = self.core.clone();
                tokio::spawn(async move {
                    core.deliver(raw, permit).await;
                });
            }
            InvokeThread::Io => {
                let sender = {
                    let pool = self.pool.lock().unwrap();
                    if pool.is_empty() {
                        None
                    } else {
                        let index =
                            partition.partition_number().unsigned_abs() as usize % pool.len();
                        Some(pool[index].clone())
                    }
                };
                match sender {
                    Some(sender) => {
                        if sender.send((raw, permit)).await.is_err() {
                            warn!(%partition, "dispatch pool stopped; dropping message");
                            self.core.observer.on_error(&PipelineError::Cancelled);
                            self.core.in_flight.exit(&partition);
                        }
                    }
                    None => {
                        // Pool already shut down.
                        self.core.observer.on_error(&PipelineError::Cancelled);
                        self.core.in_flight.exit(&partition);
                    }
                }
            }
        }
    }

    /// Serial worker for a partition, created on first use.
    fn partition_worker(&self, partition: &Partition) -> mpsc::Sender<WorkItem> {
        if let Some(sender) = self.partition_workers.get(partition) {
            return sender.clone();
        }
        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let handle = spawn_worker(self.core.clone(), rx, partition.partition_number() as usize);
        self.handles.lock().unwrap().push(handle);
        self.partition_workers.insert(partition.clone(), tx.clone());
        debug!(%partition, "started serial dispatch worker");
        tx
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.core.in_flight.count()
    }

    pub(crate) fn partition_in_flight(&self, partition: &Partition) -> usize {
        self.core.in_flight.partition_count(partition)
    }

    /// Wait for in-flight deliveries to finish: all of them, or only the given
    /// partitions'.
    pub(crate) async fn drain(&self, partitions: Option<&[Partition]>) {
        loop {
            let remaining = match partitions {
                Some(partitions) => partitions
                    .iter()
                    .map(|p| self.partition_in_flight(p))
                    .sum::<usize>(),
                None => self.in_flight(),
            };
            if remaining == 0 {
                return;
            }
            debug!(remaining, "waiting for in-flight deliveries");
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop all workers after the queues empty. Idempotent.
    pub(crate) async fn shutdown(&self) {
        self.partition_workers.clear();
        self.pool.lock().unwrap().clear();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch worker panicked during shutdown");
            }
        }
    }
}

fn spawn_worker<M, R>(
    core: Arc<DispatchCore<M, R>>,
    mut rx: mpsc::Receiver<WorkItem>,
    index: usize,
) -> JoinHandle<()>
where
    M: MessageParser,
    R: MessageReceiver<M::Key, M::Payload>,
{
    tokio::spawn(async move {
        debug!(index, "dispatch worker started");
        while let Some((raw, permit)) = rx.recv().await {
            core.deliver(raw, permit).await;
        }
        debug!(index, "dispatch worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KafkaClient;
    use crate::message::BytesParser;
    use crate::observer::NoopObserver;
    use crate::testing::{test_message, MockKafkaClient};
    use crate::types::{OffsetWatermark, PartitionAssignment, StartOffset};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingReceiver {
        seen: StdMutex<Vec<(i32, i64)>>,
        /// Sleep longer for earlier offsets to shake out ordering violations.
        inverted_delay: bool,
        fail_all: bool,
        release_all: bool,
        commit_explicitly: bool,
    }

    impl RecordingReceiver {
        fn new() -> Self {
            Self {
                seen: StdMutex::new(Vec::new()),
                inverted_delay: false,
                fail_all: false,
                release_all: false,
                commit_explicitly: false,
            }
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
    impl MessageReceiver<Vec<u8>, Vec<u8>> for RecordingReceiver {
        async fn receive(
            &self,
            message: ReceivedMessage<Vec<u8>, Vec<u8>>,
            guard: CommitGuard,
        ) -> anyhow::Result<()> {
            if self.inverted_delay {
                let delay = 20u64.saturating_sub(message.offset() as u64 * 2);
                sleep(Duration::from_millis(delay)).await;
            }
            self.seen
                .lock()
                .unwrap()
                .push((message.partition_number(), message.offset()));
            if self.release_all {
                guard.release();
            }
            if self.commit_explicitly {
                guard.commit().await?;
            }
            if self.fail_all {
                anyhow::bail!("receiver rejected the message");
            }
            Ok(())
        }
    }

    async fn setup<R>(
        config: &PipelineConfig,
        receiver: Arc<R>,
        preprocessor: Option<Arc<dyn Preprocessor>>,
        partitions: &[i32],
    ) -> (Arc<MockKafkaClient>, Dispatcher<BytesParser, R>)
    where
        R: MessageReceiver<Vec<u8>, Vec<u8>>,
    {
        let client = Arc::new(MockKafkaClient::new());
        let manager = Arc::new(OffsetManager::new(config, Arc::new(NoopObserver)));
        manager.register_topic(
            "events",
            client.clone() as Arc<dyn KafkaClient>,
            config.auto_reset_at_end,
        );
        let assignments: Vec<PartitionAssignment> = partitions
            .iter()
            .map(|&p| {
                let partition = Partition::new("events", p);
                client.set_watermarks(&partition, OffsetWatermark::new(0, 1000));
                PartitionAssignment::new(partition, StartOffset::Beginning)
            })
            .collect();
        manager.install_assignment(&assignments).await.unwrap();

        let dispatcher = Dispatcher::new(
            config,
            Arc::new(BytesParser),
            receiver,
            preprocessor,
            manager,
            Arc::new(NoopObserver),
        );
        (client, dispatcher)
    }

    fn raw(partition: i32, offset: i64) -> RawMessage {
        RawMessage::from_owned(&test_message("events", partition, offset, "payload"))
    }

    #[tokio::test]
    async fn test_ordered_dispatch_preserves_offset_order() {
        let mut config = PipelineConfig::default();
        config.preserve_message_order = true;
        config.receive_callback_exec = ExecMode::Async;
        let mut receiver = RecordingReceiver::new();
        receiver.inverted_delay = true;
        let receiver = Arc::new(receiver);
        let (_client, dispatcher) = setup(&config, receiver.clone(), None, &[0, 1]).await;

        for offset in 0..10 {
            dispatcher.dispatch(raw(0, offset), None).await;
            dispatcher.dispatch(raw(1, offset), None).await;
        }
        dispatcher.drain(None).await;

        for partition in [0, 1] {
            let offsets = receiver.offsets(partition);
            assert_eq!(offsets, (0..10).collect::<Vec<i64>>());
        }
    }

    #[tokio::test]
    async fn test_sync_exec_delivers_inline() {
        let mut config = PipelineConfig::default();
        config.receive_callback_exec = ExecMode::Sync;
        let receiver = Arc::new(RecordingReceiver::new());
        let (_client, dispatcher) = setup(&config, receiver.clone(), None, &[0]).await;

        for offset in 0..5 {
            dispatcher.dispatch(raw(0, offset), None).await;
            // Inline execution: already delivered when dispatch returns.
            assert_eq!(receiver.offsets(0).len() as i64, offset + 1);
        }
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_io_pool_dispatch_delivers_everything() {
        let mut config = PipelineConfig::default();
        config.receive_invoke_thread = InvokeThread::Io;
        config.receive_callback_exec = ExecMode::Async;
        config.thread_range_low = 0;
        config.thread_range_high = 2;
        let receiver = Arc::new(RecordingReceiver::new());
        let (_client, dispatcher) = setup(&config, receiver.clone(), None, &[0, 1, 2, 3]).await;

        for partition in 0..4 {
            for offset in 0..5 {
                dispatcher.dispatch(raw(partition, offset), None).await;
            }
        }
        dispatcher.drain(None).await;

        let total: usize = (0..4).map(|p| receiver.offsets(p).len()).sum();
        assert_eq!(total, 20);
        // Pinned placement keeps each partition on one worker, so order holds
        // per partition even without serial workers.
        for partition in 0..4 {
            assert_eq!(receiver.offsets(partition), (0..5).collect::<Vec<i64>>());
        }
    }

    #[tokio::test]
    async fn test_auto_persist_advances_offsets() {
        let mut config = PipelineConfig::default();
        config.receive_callback_exec = ExecMode::Sync;
        config.commit_exec = ExecMode::Sync;
        let receiver = Arc::new(RecordingReceiver::new());
        let (client, dispatcher) = setup(&config, receiver, None, &[0]).await;

        for offset in 0..3 {
            dispatcher.dispatch(raw(0, offset), None).await;
        }
        dispatcher.drain(None).await;

        let last = client.commit_log().last().cloned().unwrap();
        assert_eq!(last.offset(), 3);
    }

    #[tokio::test]
    async fn test_skip_still_advances_offset() {
        let mut config = PipelineConfig::default();
        config.receive_callback_exec = ExecMode::Sync;
        config.commit_exec = ExecMode::Sync;
        let receiver = Arc::new(RecordingReceiver::new());
        let skip_odd: Arc<dyn Preprocessor> = Arc::new(|raw: &RawMessage| {
            if raw.offset() % 2 == 1 {
                PreprocessOutcome::Skip
            } else {
                PreprocessOutcome::Keep
            }
        });
        let (client, dispatcher) = setup(&config, receiver.clone(), Some(skip_odd), &[0]).await;

        for offset in 0..6 {
            dispatcher.dispatch(raw(0, offset), None).await;
        }
        dispatcher.drain(None).await;

        // Only even offsets reached the receiver, but the committed position
        // covers everything.
        assert_eq!(receiver.offsets(0), vec![0, 2, 4]);
        assert_eq!(client.commit_log().last().unwrap().offset(), 6);
    }

    #[tokio::test]
    async fn test_preprocessor_failure_skips_persist() {
        let mut config = PipelineConfig::default();
        config.receive_callback_exec = ExecMode::Sync;
        config.commit_exec = ExecMode::Sync;
        config.auto_persist_on_exception = false;
        let receiver = Arc::new(RecordingReceiver::new());
        let fail_all: Arc<dyn Preprocessor> =
            Arc::new(|_: &RawMessage| PreprocessOutcome::Fail("boom".to_string()));
        let (client, dispatcher) = setup(&config, receiver.clone(), Some(fail_all), &[0]).await;

        dispatcher.dispatch(raw(0, 0), None).await;
        dispatcher.drain(None).await;

        assert!(receiver.offsets(0).is_empty());
        assert!(client.commit_log().is_empty());
    }

    #[tokio::test]
    async fn test_failed_receiver_skips_persist_by_default() {
        let mut config = PipelineConfig::default();
        config.receive_callback_exec = ExecMode::Sync;
        config.commit_exec = ExecMode::Sync;
        config.auto_persist_on_exception = false;
        let mut receiver = RecordingReceiver::new();
        receiver.fail_all = true;
        let (client, dispatcher) = setup(&config, Arc::new(receiver), None, &[0]).await;

        dispatcher.dispatch(raw(0, 0), None).await;
        dispatcher.drain(None).await;
        assert!(client.commit_log().is_empty());
    }

    #[tokio::test]
    async fn test_failed_receiver_persists_when_configured() {
        let mut config = PipelineConfig::default();
        config.receive_callback_exec = ExecMode::Sync;
        config.commit_exec = ExecMode::Sync;
        config.auto_persist_on_exception = true;
        let mut receiver = RecordingReceiver::new();
        receiver.fail_all = true;
        let (client, dispatcher) = setup(&config, Arc::new(receiver), None, &[0]).await;

        dispatcher.dispatch(raw(0, 0), None).await;
        dispatcher.drain(None).await;
        assert_eq!(client.commit_log().last().unwrap().offset(), 1);
    }

    #[tokio::test]
    async fn test_released_guard_suppresses_persist() {
        let mut config = PipelineConfig::default();
        config.receive_callback_exec = ExecMode::Sync;
        config.commit_exec = ExecMode::Sync;
        let mut receiver = RecordingReceiver::new();
        receiver.release_all = true;
        let (client, dispatcher) = setup(&config, Arc::new(receiver), None, &[0]).await;

        dispatcher.dispatch(raw(0, 0), None).await;
        dispatcher.drain(None).await;
        assert!(client.commit_log().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_commit_persists_exactly_once() {
        let mut config = PipelineConfig::default();
        config.receive_callback_exec = ExecMode::Sync;
        config.commit_exec = ExecMode::Sync;
        let mut receiver = RecordingReceiver::new();
        receiver.commit_explicitly = true;
        let (client, dispatcher) = setup(&config, Arc::new(receiver), None, &[0]).await;

        dispatcher.dispatch(raw(0, 0), None).await;
        dispatcher.drain(None).await;
        assert_eq!(client.commit_log().len(), 1);
        assert_eq!(client.commit_log()[0].offset(), 1);
    }

    /// Moves the guard into a background task; the message is only "done"
    /// when that task drops it.
    struct DeferringReceiver {
        hold: Duration,
    }

    #[async_trait]
    impl MessageReceiver<Vec<u8>, Vec<u8>> for DeferringReceiver {
        async fn receive(
            &self,
            _message: ReceivedMessage<Vec<u8>, Vec<u8>>,
            guard: CommitGuard,
        ) -> anyhow::Result<()> {
            let hold = self.hold;
            tokio::spawn(async move {
                sleep(hold).await;
                drop(guard);
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_guard_kept_past_receive_persists_at_drop() {
        let mut config = PipelineConfig::default();
        config.receive_callback_exec = ExecMode::Sync;
        config.commit_exec = ExecMode::Sync;
        let receiver = Arc::new(DeferringReceiver {
            hold: Duration::from_millis(150),
        });
        let (client, dispatcher) = setup(&config, receiver, None, &[0]).await;

        dispatcher.dispatch(raw(0, 0), None).await;
        dispatcher.drain(None).await;

        // The receiver returned, but the guard is still alive: no persist yet.
        assert!(client.commit_log().is_empty());

        // Once the background task drops the guard, the offset lands.
        for _ in 0..100 {
            if !client.commit_log().is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.commit_log(), vec![PartitionOffset::new(
            Partition::new("events", 0),
            1,
        )]);
    }

    #[tokio::test]
    async fn test_budget_reservation_blocks_when_exhausted() {
        let mut config = PipelineConfig::default();
        config.read_size = 2;
        let receiver = Arc::new(RecordingReceiver::new());
        let (_client, dispatcher) = setup(&config, receiver, None, &[0]).await;

        let p1 = dispatcher.reserve(Duration::from_millis(20)).await;
        let p2 = dispatcher.reserve(Duration::from_millis(20)).await;
        assert!(p1.is_some());
        assert!(p2.is_some());
        // Budget of 2 is spent.
        assert!(dispatcher.reserve(Duration::from_millis(20)).await.is_none());
        drop(p1);
        assert!(dispatcher.reserve(Duration::from_millis(50)).await.is_some());
    }
}
