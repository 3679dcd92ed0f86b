//! Metric names emitted by the pipeline.

pub const MESSAGES_RECEIVED: &str = "kafka_pipeline_messages_received";
pub const MESSAGES_SKIPPED: &str = "kafka_pipeline_messages_skipped";
pub const MESSAGES_IN_FLIGHT: &str = "kafka_pipeline_messages_in_flight";
pub const RECEIVER_FAILURES: &str = "kafka_pipeline_receiver_failures";
pub const PREPROCESSOR_FAILURES: &str = "kafka_pipeline_preprocessor_failures";
pub const DECODE_FAILURES: &str = "kafka_pipeline_decode_failures";
pub const PARTITION_EOF: &str = "kafka_pipeline_partition_eof";
pub const COMMITS: &str = "kafka_pipeline_commits";
pub const COMMIT_RETRIES: &str = "kafka_pipeline_commit_retries";
pub const COMMIT_FAILURES: &str = "kafka_pipeline_commit_failures";
pub const OFFSETS_STORED: &str = "kafka_pipeline_offsets_stored";
pub const CURRENT_OFFSET: &str = "kafka_pipeline_current_offset";
pub const POLL_BACKPRESSURE: &str = "kafka_pipeline_poll_backpressure";
pub const FETCH_ERRORS: &str = "kafka_pipeline_fetch_errors";
