use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::Offset;
use serde::Serialize;

/// A (topic, partition) pair identifying a single Kafka partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// A partition together with a concrete offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
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
}

/// Broker-reported offset bounds for a partition.
///
/// `low` is the first available offset; `high` is the next offset to be
/// assigned, i.e. one past the last message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OffsetWatermark {
    pub low: i64,
    pub high: i64,
}

impl OffsetWatermark {
    pub fn new(low: i64, high: i64) -> Self {
        Self { low, high }
    }

    /// True when the partition has no messages at or past `start_offset`.
    pub fn at_end(&self, start_offset: i64) -> bool {
        self.high <= start_offset
    }
}

/// Requested starting position for a partition at assignment time.
///
/// `Stored` resolves against the consumer group's committed offset and falls
/// back to a watermark chosen by `auto.offset.reset`. `Tail(n)` rewinds `n`
/// messages from the high watermark, clamped to the valid range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Stored,
    Beginning,
    End,
    Tail(i64),
    Exact(i64),
}

impl StartOffset {
    pub fn from_raw(offset: Offset) -> Self {
        match offset {
            Offset::Beginning => StartOffset::Beginning,
            Offset::End => StartOffset::End,
            Offset::Stored | Offset::Invalid => StartOffset::Stored,
            Offset::OffsetTail(n) => StartOffset::Tail(n),
            Offset::Offset(v) => StartOffset::Exact(v),
        }
    }
}

/// A partition with its requested starting position, as handed to the
/// assignment path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    partition: Partition,
    start: StartOffset,
}

impl PartitionAssignment {
    pub fn new(partition: Partition, start: StartOffset) -> Self {
        Self { partition, start }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn start(&self) -> StartOffset {
        self.start
    }
}

impl From<TopicPartitionListElem<'_>> for PartitionAssignment {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(
            Partition::new(elem.topic().to_string(), elem.partition()),
            StartOffset::from_raw(elem.offset()),
        )
    }
}
