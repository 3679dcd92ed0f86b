use std::time::Duration;

use rdkafka::ClientConfig;

use crate::error::{PipelineError, Result};

/// How acknowledged offsets reach the broker.
///
/// `Commit` writes straight to the broker; `Store` hands the offset to the
/// client's in-memory store, which the native auto-committer flushes
/// periodically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStrategy {
    Commit,
    Store,
}

/// Whether a persist call blocks for the broker response or completes in the
/// background, forwarding errors through the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Sync,
    Async,
}

/// Fetch strategy used by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStrategy {
    Serial,
    Batch,
    RoundRobin,
}

/// Where receiver callbacks run: cooperative tasks or the dedicated
/// blocking-work pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeThread {
    Coro,
    Io,
}

/// Delay growth curve for commit retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

/// Timeout applied to broker-facing metadata and commit calls.
///
/// `Default` defers to the native client's configured timeout; `Unlimited`
/// never times out; `Millis` is a hard bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerTimeout {
    Default,
    Unlimited,
    Millis(u64),
}

impl BrokerTimeout {
    /// Resolve against the fallback used when the option was left at its
    /// default.
    pub fn duration_or(&self, default: Duration) -> Option<Duration> {
        match self {
            BrokerTimeout::Default => Some(default),
            BrokerTimeout::Unlimited => None,
            BrokerTimeout::Millis(ms) => Some(Duration::from_millis(*ms)),
        }
    }
}

const OPT_PAUSE_ON_START: &str = "internal.consumer.pause.on.start";
const OPT_TIMEOUT_MS: &str = "internal.consumer.timeout.ms";
const OPT_POLL_TIMEOUT_MS: &str = "internal.consumer.poll.timeout.ms";
const OPT_MIN_POLL_INTERVAL_MS: &str = "internal.consumer.min.poll.interval.ms";
const OPT_AUTO_OFFSET_PERSIST: &str = "internal.consumer.auto.offset.persist";
const OPT_AUTO_OFFSET_PERSIST_ON_EXCEPTION: &str =
    "internal.consumer.auto.offset.persist.on.exception";
const OPT_OFFSET_PERSIST_STRATEGY: &str = "internal.consumer.offset.persist.strategy";
const OPT_COMMIT_EXEC: &str = "internal.consumer.commit.exec";
const OPT_COMMIT_NUM_RETRIES: &str = "internal.consumer.commit.num.retries";
const OPT_COMMIT_BACKOFF_STRATEGY: &str = "internal.consumer.commit.backoff.strategy";
const OPT_COMMIT_BACKOFF_INTERVAL_MS: &str = "internal.consumer.commit.backoff.interval.ms";
const OPT_COMMIT_MAX_BACKOFF_MS: &str = "internal.consumer.commit.max.backoff.ms";
const OPT_POLL_STRATEGY: &str = "internal.consumer.poll.strategy";
const OPT_READ_SIZE: &str = "internal.consumer.read.size";
const OPT_BATCH_PREFETCH: &str = "internal.consumer.batch.prefetch";
const OPT_THREAD_RANGE_LOW: &str = "internal.consumer.receive.callback.thread.range.low";
const OPT_THREAD_RANGE_HIGH: &str = "internal.consumer.receive.callback.thread.range.high";
const OPT_RECEIVE_CALLBACK_EXEC: &str = "internal.consumer.receive.callback.exec";
const OPT_RECEIVE_INVOKE_THREAD: &str = "internal.consumer.receive.invoke.thread";
const OPT_PREPROCESS_MESSAGES: &str = "internal.consumer.preprocess.messages";
const OPT_PRESERVE_MESSAGE_ORDER: &str = "internal.consumer.preserve.message.order";
const OPT_AUTO_THROTTLE: &str = "internal.consumer.auto.throttle";
const OPT_AUTO_THROTTLE_MULTIPLIER: &str = "internal.consumer.auto.throttle.multiplier";
const OPT_AUTO_OFFSET_RESET: &str = "auto.offset.reset";

/// Fully validated pipeline configuration.
///
/// Built from a `key=value` option map: `internal.consumer.*` keys configure
/// the pipeline itself (unknown internal keys are rejected), everything else
/// passes through to the native client untouched.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub pause_on_start: bool,
    pub broker_timeout: BrokerTimeout,
    pub poll_timeout: BrokerTimeout,
    pub min_poll_interval: Duration,
    pub auto_offset_persist: bool,
    pub auto_persist_on_exception: bool,
    pub persist_strategy: PersistStrategy,
    pub commit_exec: ExecMode,
    pub commit_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_interval: Duration,
    pub max_backoff: Duration,
    pub poll_strategy: PollStrategy,
    pub read_size: i64,
    pub batch_prefetch: bool,
    pub thread_range_low: usize,
    pub thread_range_high: usize,
    pub receive_callback_exec: ExecMode,
    pub receive_invoke_thread: InvokeThread,
    pub preprocess_messages: bool,
    pub preserve_message_order: bool,
    pub auto_throttle: bool,
    pub auto_throttle_multiplier: u32,
    /// Derived from the native `auto.offset.reset` option: when no committed
    /// offset exists, start from the high watermark (true) or the low (false).
    pub auto_reset_at_end: bool,
    /// Non-internal options forwarded to the native client.
    native_overrides: Vec<(String, String)>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pause_on_start: false,
            broker_timeout: BrokerTimeout::Default,
            poll_timeout: BrokerTimeout::Millis(1000),
            min_poll_interval: Duration::from_millis(10),
            auto_offset_persist: true,
            auto_persist_on_exception: false,
            persist_strategy: PersistStrategy::Commit,
            commit_exec: ExecMode::Async,
            commit_retries: 3,
            backoff_strategy: BackoffStrategy::Linear,
            backoff_interval: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            poll_strategy: PollStrategy::Batch,
            read_size: 100,
            batch_prefetch: false,
            thread_range_low: 0,
            thread_range_high: 3,
            receive_callback_exec: ExecMode::Async,
            receive_invoke_thread: InvokeThread::Coro,
            preprocess_messages: true,
            preserve_message_order: false,
            auto_throttle: false,
            auto_throttle_multiplier: 1,
            auto_reset_at_end: true,
            native_overrides: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Parse an option map into a validated configuration.
    pub fn from_options<I, K, V>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            config.apply_option(key.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            OPT_PAUSE_ON_START => self.pause_on_start = parse_bool(key, value)?,
            OPT_TIMEOUT_MS => self.broker_timeout = parse_timer(key, value)?,
            OPT_POLL_TIMEOUT_MS => self.poll_timeout = parse_timer(key, value)?,
            OPT_MIN_POLL_INTERVAL_MS => {
                self.min_poll_interval = Duration::from_millis(parse_min(key, value, 1)?)
            }
            OPT_AUTO_OFFSET_PERSIST => self.auto_offset_persist = parse_bool(key, value)?,
            OPT_AUTO_OFFSET_PERSIST_ON_EXCEPTION => {
                self.auto_persist_on_exception = parse_bool(key, value)?
            }
            OPT_OFFSET_PERSIST_STRATEGY => {
                self.persist_strategy = match value {
                    "commit" => PersistStrategy::Commit,
                    "store" => PersistStrategy::Store,
                    _ => return Err(invalid(key, value, "expected 'commit' or 'store'")),
                }
            }
            OPT_COMMIT_EXEC => self.commit_exec = parse_exec(key, value)?,
            OPT_COMMIT_NUM_RETRIES => self.commit_retries = parse_min(key, value, 0)? as u32,
            OPT_COMMIT_BACKOFF_STRATEGY => {
                self.backoff_strategy = match value {
                    "linear" => BackoffStrategy::Linear,
                    "exponential" => BackoffStrategy::Exponential,
                    _ => return Err(invalid(key, value, "expected 'linear' or 'exponential'")),
                }
            }
            OPT_COMMIT_BACKOFF_INTERVAL_MS => {
                self.backoff_interval = Duration::from_millis(parse_min(key, value, 1)?)
            }
            OPT_COMMIT_MAX_BACKOFF_MS => {
                self.max_backoff = Duration::from_millis(parse_min(key, value, 1)?)
            }
            OPT_POLL_STRATEGY => {
                self.poll_strategy = match value {
                    "serial" => PollStrategy::Serial,
                    "batch" => PollStrategy::Batch,
                    "roundrobin" => PollStrategy::RoundRobin,
                    _ => {
                        return Err(invalid(
                            key,
                            value,
                            "expected 'serial', 'batch' or 'roundrobin'",
                        ))
                    }
                }
            }
            OPT_READ_SIZE => {
                let parsed = parse_i64(key, value)?;
                if parsed != -1 && parsed < 1 {
                    return Err(invalid(key, value, "expected -1 or a value >= 1"));
                }
                self.read_size = parsed;
            }
            OPT_BATCH_PREFETCH => self.batch_prefetch = parse_bool(key, value)?,
            OPT_THREAD_RANGE_LOW => self.thread_range_low = parse_min(key, value, 0)? as usize,
            OPT_THREAD_RANGE_HIGH => self.thread_range_high = parse_min(key, value, 0)? as usize,
            OPT_RECEIVE_CALLBACK_EXEC => self.receive_callback_exec = parse_exec(key, value)?,
            OPT_RECEIVE_INVOKE_THREAD => {
                self.receive_invoke_thread = match value {
                    "io" => InvokeThread::Io,
                    "coro" => InvokeThread::Coro,
                    _ => return Err(invalid(key, value, "expected 'io' or 'coro'")),
                }
            }
            OPT_PREPROCESS_MESSAGES => self.preprocess_messages = parse_bool(key, value)?,
            OPT_PRESERVE_MESSAGE_ORDER => self.preserve_message_order = parse_bool(key, value)?,
            OPT_AUTO_THROTTLE => self.auto_throttle = parse_bool(key, value)?,
            OPT_AUTO_THROTTLE_MULTIPLIER => {
                self.auto_throttle_multiplier = parse_min(key, value, 1)? as u32
            }
            OPT_AUTO_OFFSET_RESET => {
                // Native option, but it decides where a fresh assignment starts
                // when the broker has no committed offset.
                self.auto_reset_at_end =
                    !matches!(value, "smallest" | "earliest" | "beginning");
                self.native_overrides
                    .push((key.to_string(), value.to_string()));
            }
            other if other.starts_with("internal.") => {
                return Err(PipelineError::invalid_option(other, "unknown option"));
            }
            other => {
                self.native_overrides
                    .push((other.to_string(), value.to_string()));
            }
        }
        Ok(())
    }

    /// Cross-option constraints checked after all options are applied.
    pub fn validate(&self) -> Result<()> {
        if self.max_backoff < self.backoff_interval {
            return Err(PipelineError::invalid_option(
                OPT_COMMIT_MAX_BACKOFF_MS,
                format!(
                    "must be >= {} ({}ms < {}ms)",
                    OPT_COMMIT_BACKOFF_INTERVAL_MS,
                    self.max_backoff.as_millis(),
                    self.backoff_interval.as_millis()
                ),
            ));
        }
        if self.thread_range_high < self.thread_range_low {
            return Err(PipelineError::invalid_option(
                OPT_THREAD_RANGE_HIGH,
                format!(
                    "must be >= {} ({} < {})",
                    OPT_THREAD_RANGE_LOW, self.thread_range_high, self.thread_range_low
                ),
            ));
        }
        if let BrokerTimeout::Millis(poll_ms) = self.poll_timeout {
            if self.min_poll_interval.as_millis() as u64 > poll_ms {
                return Err(PipelineError::invalid_option(
                    OPT_MIN_POLL_INTERVAL_MS,
                    "must not exceed the poll timeout",
                ));
            }
        }
        Ok(())
    }

    /// Number of receiver workers in the dispatch pool.
    pub fn callback_pool_size(&self) -> usize {
        self.thread_range_high - self.thread_range_low + 1
    }

    /// In-flight budget for the Serial and Batch strategies. RoundRobin is
    /// unbounded by design.
    pub fn in_flight_budget(&self) -> usize {
        if self.poll_strategy == PollStrategy::RoundRobin || self.read_size < 0 {
            tokio::sync::Semaphore::MAX_PERMITS
        } else {
            self.read_size as usize
        }
    }

    /// Fetch bound used by the poller; unlimited polls fall back to the
    /// minimum poll interval so shutdown is never blocked indefinitely.
    pub fn poll_wait(&self) -> Duration {
        match self.poll_timeout {
            BrokerTimeout::Millis(ms) => Duration::from_millis(ms),
            _ => self.min_poll_interval,
        }
    }

    /// Build the native client configuration.
    ///
    /// The offset store is always manual: the pipeline decides what is safe to
    /// persist. Native auto-commit is enabled only under the `Store` strategy,
    /// where it flushes stored offsets in the background.
    pub fn client_config(&self, bootstrap_servers: &str, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set(
                "enable.auto.commit",
                if self.persist_strategy == PersistStrategy::Store {
                    "true"
                } else {
                    "false"
                },
            )
            .set("enable.partition.eof", "true")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "5000");
        for (key, value) in &self.native_overrides {
            config.set(key, value);
        }
        config
    }
}

fn invalid(key: &str, value: &str, expected: &str) -> PipelineError {
    PipelineError::invalid_option(key, format!("'{value}': {expected}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value, "expected 'true' or 'false'")),
    }
}

fn parse_i64(key: &str, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|_| invalid(key, value, "expected an integer"))
}

fn parse_min(key: &str, value: &str, min: i64) -> Result<u64> {
    let parsed = parse_i64(key, value)?;
    if parsed < min {
        return Err(invalid(key, value, &format!("expected a value >= {min}")));
    }
    Ok(parsed as u64)
}

/// Timer options accept -1 (unlimited) or a positive millisecond bound.
fn parse_timer(key: &str, value: &str) -> Result<BrokerTimeout> {
    match parse_i64(key, value)? {
        -1 => Ok(BrokerTimeout::Unlimited),
        ms if ms >= 1 => Ok(BrokerTimeout::Millis(ms as u64)),
        _ => Err(invalid(key, value, "expected -1 or a value >= 1")),
    }
}

fn parse_exec(key: &str, value: &str) -> Result<ExecMode> {
    match value {
        "sync" => Ok(ExecMode::Sync),
        "async" => Ok(ExecMode::Async),
        _ => Err(invalid(key, value, "expected 'sync' or 'async'")),
    }
}
