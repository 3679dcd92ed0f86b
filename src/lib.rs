//! High-level Kafka consumer framework on top of `rdkafka`.
//!
//! The pipeline layers three things over the raw client: a polling engine
//! with pluggable fetch strategies, a dispatch layer that hands typed
//! messages to application receivers under configurable ordering and
//! threading policies, and a gap-tolerant offset manager that turns
//! out-of-order acknowledgments into monotonic, commit-safe checkpoints.
//! Offsets are committed only after the receiver has observed the message,
//! making at-least-once delivery the default.

pub mod client;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod metrics_consts;
pub mod observer;
pub mod offsets;
pub mod partition;
pub mod poller;
pub mod retry;
pub mod testing;
pub mod types;

pub use client::{FetchEvent, KafkaClient, RdKafkaClient, RebalanceEvent};
pub use config::{
    BackoffStrategy, BrokerTimeout, ExecMode, InvokeThread, PersistStrategy, PipelineConfig,
    PollStrategy,
};
pub use consumer::{ConsumerManager, PartitionMetadata, TopicMetadata};
pub use error::{PipelineError, Result};
pub use message::{
    BytesParser, CommitGuard, Decoded, JsonParser, MessageHeaders, MessageParser, MessageReceiver,
    PreprocessOutcome, Preprocessor, RawMessage, ReceivedMessage,
};
pub use observer::PipelineObserver;
pub use offsets::{IntervalSet, OffsetInterval, OffsetManager, OffsetTracker, ResetAction};
pub use partition::{AssignmentPhase, PartitionState};
pub use retry::CommitRetryPolicy;
pub use types::{OffsetWatermark, Partition, PartitionAssignment, PartitionOffset, StartOffset};
