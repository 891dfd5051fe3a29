//! The Non-Blocking Retry Producer: republishes failed records onto retry topics (§4.5).
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::error::HandlerError;
use crate::record::ConsumerRecord;

/// A record about to be published to a retry topic.
///
/// `partition` is `None` to let the producer's own partitioner place the record (by key,
/// or round-robin if the key is absent), matching how the record would have been produced
/// the first time.
#[derive(Clone, Debug, PartialEq)]
pub struct ProducedRecord {
    /// Key to produce the record with.
    pub key: Option<Vec<u8>>,

    /// Payload to produce.
    pub value: Vec<u8>,

    /// Headers to produce, including the encoded retry scheduling headers.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Partition to produce to, if the caller wants to pin it.
    pub partition: Option<i32>,
}

/// Republishes records onto retry topics with the headers from `header` (§4.5).
#[derive(Clone)]
pub struct NonBlockingRetryProducer(Arc<dyn RetryProducerBackend>);

impl NonBlockingRetryProducer {
    /// Republish `record` onto `topic`, stamping it with the scheduling headers for
    /// `attempt` and `backoff`.
    ///
    /// A publish failure is treated as retriable (§4.5): the caller should not
    /// acknowledge the original record, letting the consumer redeliver it so the whole
    /// dispatch is attempted again.
    pub async fn republish(
        &self,
        record: &ConsumerRecord,
        topic: String,
        attempt: u32,
        backoff: Duration,
        submitted_at: OffsetDateTime,
    ) -> Result<(), HandlerError> {
        let mut headers = record.headers.clone();
        crate::header::encode(&mut headers, attempt, submitted_at, backoff);
        let produced = ProducedRecord {
            key: record.key.clone(),
            value: record.value.clone(),
            headers,
            partition: None,
        };
        self.0.produce(&topic, produced).await.map_err(HandlerError::retriable)
    }

    /// Initialise a new producer backend fixture for unit tests.
    #[cfg(any(test, feature = "test-fixture"))]
    pub fn fixture() -> fixture::ProducerFixture {
        fixture::ProducerFixture::new()
    }
}

impl<T> From<T> for NonBlockingRetryProducer
where
    T: RetryProducerBackend + 'static,
{
    fn from(value: T) -> Self {
        NonBlockingRetryProducer(Arc::new(value))
    }
}

/// Operations implemented by the Kafka client backing [`NonBlockingRetryProducer`].
#[async_trait::async_trait]
pub trait RetryProducerBackend: Send + Sync {
    /// Produce `record` onto `topic`.
    async fn produce(&self, topic: &str, record: ProducedRecord) -> anyhow::Result<()>;
}

#[cfg(any(test, feature = "test-fixture"))]
pub use self::fixture::{ProducerFixture, ProducerFixtureBackend};

#[cfg(any(test, feature = "test-fixture"))]
mod fixture {
    use tokio::sync::broadcast;
    use tokio::sync::broadcast::Receiver;
    use tokio::sync::broadcast::Sender;

    use super::ProducedRecord;
    use super::RetryProducerBackend;

    /// A record captured by [`ProducerFixture`], with the topic it was produced to.
    #[derive(Clone, Debug, PartialEq)]
    pub struct ProducedEnvelope {
        /// Topic the record was produced to.
        pub topic: String,

        /// The record itself.
        pub record: ProducedRecord,
    }

    /// Introspection tool for records published during unit tests.
    pub struct ProducerFixture {
        produced: Receiver<ProducedEnvelope>,
        send_produced: Sender<ProducedEnvelope>,
    }

    impl Clone for ProducerFixture {
        fn clone(&self) -> Self {
            ProducerFixture {
                produced: self.send_produced.subscribe(),
                send_produced: self.send_produced.clone(),
            }
        }
    }

    impl ProducerFixture {
        /// Create a backend that publishes into this fixture.
        pub fn backend(&self) -> ProducerFixtureBackend {
            ProducerFixtureBackend {
                send_produced: self.send_produced.clone(),
            }
        }

        /// Initialise an empty fixture.
        pub fn new() -> ProducerFixture {
            let (send_produced, produced) = broadcast::channel(50);
            ProducerFixture { produced, send_produced }
        }

        /// Fetch the next record published to the fixture.
        pub async fn pop(&mut self) -> anyhow::Result<ProducedEnvelope> {
            let produced = self.produced.recv().await?;
            Ok(produced)
        }
    }

    /// A [`RetryProducerBackend`] that forwards every produced record to a [`ProducerFixture`].
    #[derive(Clone)]
    pub struct ProducerFixtureBackend {
        send_produced: Sender<ProducedEnvelope>,
    }

    #[async_trait::async_trait]
    impl RetryProducerBackend for ProducerFixtureBackend {
        async fn produce(&self, topic: &str, record: ProducedRecord) -> anyhow::Result<()> {
            let _ = self.send_produced.send(ProducedEnvelope {
                topic: topic.to_string(),
                record,
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConsumerRecord {
        ConsumerRecord {
            topic: "orders".into(),
            partition: 0,
            offset: 7,
            key: Some(b"order-1".to_vec()),
            value: b"payload".to_vec(),
            headers: vec![("x-app".to_string(), b"v".to_vec())],
        }
    }

    #[tokio::test]
    async fn republish_stamps_headers_and_preserves_payload() {
        let fixture = NonBlockingRetryProducer::fixture();
        let mut popper = fixture.clone();
        let producer: NonBlockingRetryProducer = fixture.backend().into();

        let submitted_at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        producer
            .republish(&record(), "orders-billing-retry-0".into(), 0, Duration::from_millis(500), submitted_at)
            .await
            .unwrap();

        let envelope = popper.pop().await.unwrap();
        assert_eq!(envelope.topic, "orders-billing-retry-0");
        assert_eq!(envelope.record.key, Some(b"order-1".to_vec()));
        assert_eq!(envelope.record.value, b"payload".to_vec());
        assert_eq!(envelope.record.partition, None);

        let decoded = crate::header::decode(&envelope.record.headers).unwrap().expect("retry headers present");
        assert_eq!(decoded.attempt, 0);
        assert_eq!(decoded.backoff, Duration::from_millis(500));
        assert_eq!(decoded.submitted_at, submitted_at);
        // The original, unrelated header survives the republish.
        assert!(envelope.record.headers.iter().any(|(k, v)| k == "x-app" && v == b"v"));
    }
}
