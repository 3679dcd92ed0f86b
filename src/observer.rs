use crate::error::PipelineError;
use crate::types::Partition;

/// Notification surface for pipeline events the application may care about.
///
/// All methods have no-op defaults; implement only what you need. Callbacks
/// run on pipeline tasks and must not block for long.
pub trait PipelineObserver: Send + Sync + 'static {
    /// A message-plane or broker-plane error. The pipeline keeps running;
    /// fatal configuration errors are returned from construction instead.
    fn on_error(&self, _error: &PipelineError) {}

    /// The partition reached its high watermark in this assignment. Delivered
    /// out of band; EOF never appears as a message in the receiver stream.
    fn on_partition_eof(&self, _partition: &Partition) {}

    /// An offset was successfully persisted. `offset` is the next offset to
    /// be consumed under the group.
    fn on_commit(&self, _partition: &Partition, _offset: i64) {}
}

/// Default observer used when the application does not install one.
pub(crate) struct NoopObserver;

impl PipelineObserver for NoopObserver {}
