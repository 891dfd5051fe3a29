//! The Kafka record shape this crate operates on and the topic+partition key derived from it.

/// A record consumed from (or about to be produced to) a Kafka topic.
///
/// Everything beyond the fields below is opaque to this crate: serialization of the
/// payload, compression, and transport details are handled entirely by the surrounding
/// consumer/producer client.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerRecord {
    /// Topic the record was read from (or will be produced to).
    pub topic: String,

    /// Partition of the topic the record was read from.
    pub partition: i32,

    /// Monotonically increasing offset of the record within its partition.
    pub offset: i64,

    /// Optional record key.
    pub key: Option<Vec<u8>>,

    /// Record payload.
    pub value: Vec<u8>,

    /// Record headers, in wire order. Names are not required to be unique.
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ConsumerRecord {
    /// The `(topic, partition)` this record belongs to.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: self.topic.clone(),
            partition: self.partition,
        }
    }

    /// Look up the most recently appended header with the given name, if any.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }
}

/// Identifies a single partition of a topic.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TopicPartition {
    /// Topic the partition belongs to.
    pub topic: String,

    /// Partition index within the topic.
    pub partition: i32,
}

impl TopicPartition {
    /// Build a new topic+partition key.
    pub fn new<S: Into<String>>(topic: S, partition: i32) -> Self {
        TopicPartition {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}
