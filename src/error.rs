use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::types::Partition;

/// Errors surfaced by the consumer pipeline.
///
/// Construction-time problems (`InvalidOption`) are fatal; everything else is
/// a message-plane or broker-plane condition that never crashes the consumer.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Unknown option, out-of-range value, or cross-option constraint
    /// violation. Surfaced at construction.
    #[error("invalid option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    /// Offset outside a tracker's known range, unknown partition, etc.
    /// Surfaced at the call site.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Retryable broker error (timeout, transport, coordinator movement).
    /// Surfaced only once the retry envelope is exhausted.
    #[error("transient broker error: {0}")]
    BrokerTransient(#[source] KafkaError),

    /// Non-retryable broker error (authorization, unknown topic).
    #[error("fatal broker error: {0}")]
    BrokerFatal(#[source] KafkaError),

    /// User preprocessor reported a failure (distinct from an intentional skip).
    #[error("preprocessor failed for {partition} offset {offset}: {reason}")]
    Preprocessor {
        partition: Partition,
        offset: i64,
        reason: String,
    },

    /// Key or payload decode failure from the user-supplied parser.
    #[error("decode failed for {partition} offset {offset}: {reason}")]
    Decode {
        partition: Partition,
        offset: i64,
        reason: String,
    },

    /// User receiver returned an error.
    #[error("receiver failed for {partition} offset {offset}: {reason}")]
    Receiver {
        partition: Partition,
        offset: i64,
        reason: String,
    },

    /// The pipeline is shutting down; pending operations were cancelled.
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

impl PipelineError {
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Classify a client error into the transient or fatal bucket.
    pub fn from_kafka(err: KafkaError) -> Self {
        if is_transient(&err) {
            PipelineError::BrokerTransient(err)
        } else {
            PipelineError::BrokerFatal(err)
        }
    }

    /// True when the commit retry envelope applies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::BrokerTransient(_))
    }
}

/// Broker errors worth retrying under the commit backoff policy.
fn is_transient(err: &KafkaError) -> bool {
    let code = match err {
        KafkaError::ConsumerCommit(code)
        | KafkaError::MessageConsumption(code)
        | KafkaError::Global(code)
        | KafkaError::OffsetFetch(code)
        | KafkaError::MetadataFetch(code) => *code,
        _ => return false,
    };
    matches!(
        code,
        RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::RebalanceInProgress
    )
}

pub type Result<T> = std::result::Result<T, PipelineError>;
