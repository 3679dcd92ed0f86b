use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rdkafka::message::{Headers, Message, OwnedMessage};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::warn;

use crate::config::ExecMode;
use crate::error::Result;
use crate::observer::PipelineObserver;
use crate::offsets::OffsetManager;
use crate::types::{Partition, PartitionOffset};

/// Flattened header list as delivered by the broker.
pub type MessageHeaders = Vec<(String, Option<Vec<u8>>)>;

/// An undecoded message as pulled off the wire, before preprocessing and
/// parsing.
#[derive(Debug, Clone)]
pub struct RawMessage {
    partition: Partition,
    offset: i64,
    timestamp: Option<SystemTime>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: MessageHeaders,
}

impl RawMessage {
    pub fn from_owned(message: &OwnedMessage) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        (
                            header.key.to_string(),
                            header.value.map(|value| value.to_vec()),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            partition: Partition::new(message.topic().to_string(), message.partition()),
            offset: message.offset(),
            timestamp: message
                .timestamp()
                .to_millis()
                .map(|ms| UNIX_EPOCH + Duration::from_millis(ms as u64)),
            key: message.key().map(|key| key.to_vec()),
            payload: message.payload().map(|payload| payload.to_vec()),
            headers,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }
}

/// Decoded key and payload produced by a [`MessageParser`].
pub struct Decoded<K, P> {
    pub key: Option<K>,
    pub payload: Option<P>,
}

/// Turns raw bytes into the application's key and payload types.
///
/// Resolved at composition time; the typed values flow through the pipeline
/// without boxing. Parse failures are reported through the observer and never
/// reach the receiver.
pub trait MessageParser: Send + Sync + 'static {
    type Key: Send + 'static;
    type Payload: Send + 'static;

    fn parse(&self, raw: &RawMessage) -> anyhow::Result<Decoded<Self::Key, Self::Payload>>;
}

/// Passes key and payload through as raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesParser;

impl MessageParser for BytesParser {
    type Key = Vec<u8>;
    type Payload = Vec<u8>;

    fn parse(&self, raw: &RawMessage) -> anyhow::Result<Decoded<Self::Key, Self::Payload>> {
        Ok(Decoded {
            key: raw.key.clone(),
            payload: raw.payload.clone(),
        })
    }
}

/// Deserializes the payload as JSON; the key stays raw bytes.
pub struct JsonParser<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Default for JsonParser<T> {
    fn default() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> MessageParser for JsonParser<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Key = Vec<u8>;
    type Payload = T;

    fn parse(&self, raw: &RawMessage) -> anyhow::Result<Decoded<Self::Key, Self::Payload>> {
        let payload = raw
            .payload
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()?;
        Ok(Decoded {
            key: raw.key.clone(),
            payload,
        })
    }
}

/// Verdict from the preprocessing hook.
///
/// `Skip` drops the message intentionally; its offset is still acknowledged so
/// the committable prefix keeps advancing. `Fail` is an error outcome and is
/// subject to the persist-on-exception setting instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreprocessOutcome {
    Keep,
    Skip,
    Fail(String),
}

/// Filter invoked on the raw message before decode.
pub trait Preprocessor: Send + Sync + 'static {
    fn preprocess(&self, raw: &RawMessage) -> PreprocessOutcome;
}

impl<F> Preprocessor for F
where
    F: Fn(&RawMessage) -> PreprocessOutcome + Send + Sync + 'static,
{
    fn preprocess(&self, raw: &RawMessage) -> PreprocessOutcome {
        self(raw)
    }
}

/// A decoded message as handed to the receiver.
pub struct ReceivedMessage<K, P> {
    partition: Partition,
    offset: i64,
    timestamp: Option<SystemTime>,
    pub key: Option<K>,
    pub payload: Option<P>,
    pub headers: MessageHeaders,
}

impl<K, P> ReceivedMessage<K, P> {
    pub(crate) fn new(
        partition: Partition,
        offset: i64,
        timestamp: Option<SystemTime>,
        key: Option<K>,
        payload: Option<P>,
        headers: MessageHeaders,
    ) -> Self {
        Self {
            partition,
            offset,
            timestamp,
            key,
            payload,
            headers,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }
}

/// Application callback invoked per decoded message.
///
/// Unless the guard is released or committed explicitly, the message's offset
/// is persisted automatically once the call returns (subject to the
/// auto-persist settings), which makes at-least-once the default.
#[async_trait]
pub trait MessageReceiver<K, P>: Send + Sync + 'static {
    async fn receive(&self, message: ReceivedMessage<K, P>, guard: CommitGuard)
        -> anyhow::Result<()>;
}

/// A persist handed to the background worker when a guard's drop wins the
/// disposition rendezvous; `Drop` itself cannot await.
pub(crate) struct PersistRequest {
    pub(crate) partition: Partition,
    pub(crate) offset: i64,
}

/// Spawns the task that applies persists requested from guard drops. It ends
/// once every sender (the dispatcher's and the outstanding guards') is gone.
pub(crate) fn spawn_persist_worker(
    manager: Arc<OffsetManager>,
    observer: Arc<dyn PipelineObserver>,
) -> mpsc::UnboundedSender<PersistRequest> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistRequest>();
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            if let Err(err) = manager
                .save_offset(
                    &PartitionOffset::new(request.partition, request.offset),
                    None,
                )
                .await
            {
                observer.on_error(&err);
            }
        }
    });
    tx
}

/// Disposition shared between a guard and the dispatcher that created it.
///
/// The automatic persist needs two facts: that the guard was dropped without
/// being released, and whether the receiver failed. They arrive from
/// different places (the guard's `Drop`, the dispatcher once `receive`
/// resolves) in either order, so both sides rendezvous here and the second
/// arrival claims the persist. All policy lives in [`GuardState::claim`];
/// neither side decides on its own.
pub(crate) struct GuardState {
    released: AtomicBool,
    persisted: AtomicBool,
    failed: AtomicBool,
    arrivals: AtomicU8,
    auto_persist: bool,
    persist_on_exception: bool,
}

impl GuardState {
    fn new(auto_persist: bool, persist_on_exception: bool) -> Self {
        Self {
            released: AtomicBool::new(false),
            persisted: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            arrivals: AtomicU8::new(0),
            auto_persist,
            persist_on_exception,
        }
    }

    /// True for exactly the second of the two rendezvous arrivals.
    fn arrive(&self) -> bool {
        self.arrivals.fetch_add(1, Ordering::SeqCst) == 1
    }

    /// The persist-unless-released contract. At most one caller ever wins the
    /// claim, which keeps the persist-at-most-once invariant.
    fn claim(&self) -> bool {
        self.auto_persist
            && !self.released.load(Ordering::SeqCst)
            && (!self.failed.load(Ordering::SeqCst) || self.persist_on_exception)
            && !self.persisted.swap(true, Ordering::SeqCst)
    }

    /// Dispatcher side: the receiver resolved. Returns true when this side
    /// must apply the persist (the guard was already dropped).
    pub(crate) fn settle_outcome(&self, failed: bool) -> bool {
        if failed {
            self.failed.store(true, Ordering::SeqCst);
        }
        self.arrive() && self.claim()
    }

    /// Guard side, from `Drop`. Returns true when the drop must apply the
    /// persist (the receiver already resolved).
    fn settle_drop(&self) -> bool {
        self.arrive() && self.claim()
    }
}

/// Couples a message's lifetime to its offset-persistence decision: unless
/// `release` or `commit` was called, dropping the guard persists the offset,
/// making at-least-once the default.
///
/// Holding the guard also holds the message's slot in the in-flight budget;
/// dropping it frees the slot.
pub struct CommitGuard {
    manager: Arc<OffsetManager>,
    partition: Partition,
    offset: i64,
    state: Arc<GuardState>,
    ack_tx: mpsc::UnboundedSender<PersistRequest>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl CommitGuard {
    pub(crate) fn new(
        manager: Arc<OffsetManager>,
        partition: Partition,
        offset: i64,
        auto_persist: bool,
        persist_on_exception: bool,
        ack_tx: mpsc::UnboundedSender<PersistRequest>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> (Self, Arc<GuardState>) {
        let state = Arc::new(GuardState::new(auto_persist, persist_on_exception));
        (
            Self {
                manager,
                partition,
                offset,
                state: state.clone(),
                ack_tx,
                _permit: permit,
            },
            state,
        )
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Take over persistence: the framework will not persist this offset.
    pub fn release(&self) {
        self.state.released.store(true, Ordering::SeqCst);
    }

    /// Persist the offset now and mark the guard released. Persisting twice
    /// through the same guard is a no-op.
    pub async fn commit(&self) -> Result<()> {
        self.commit_with(None).await
    }

    /// `commit` with an explicit exec-mode override.
    pub async fn commit_with(&self, exec: Option<ExecMode>) -> Result<()> {
        if self.state.persisted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.released.store(true, Ordering::SeqCst);
        let result = self
            .manager
            .save_offset(
                &PartitionOffset::new(self.partition.clone(), self.offset),
                exec,
            )
            .await;
        if result.is_err() {
            // Allow a retry through the same guard.
            self.state.persisted.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        // Drop cannot await, so a persist decided here is handed to the
        // worker. A guard kept alive past the receiver call (e.g. moved into
        // a background task) persists at its actual drop, not before.
        if self.state.settle_drop() {
            let request = PersistRequest {
                partition: self.partition.clone(),
                offset: self.offset,
            };
            if self.ack_tx.send(request).is_err() {
                warn!(
                    partition = %self.partition,
                    offset = self.offset,
                    "persist worker is gone; offset not persisted"
                );
            }
        }
    }
}
