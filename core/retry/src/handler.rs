//! The Retry Record Handler: the single entry point wiring every other component together (§4.6).
use std::sync::Arc;

use async_trait::async_trait;
use replicore_context::Context;

use crate::blocking::BlockingOutcome;
use crate::blocking::BlockingRetryLoop;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::conf::RetryConfig;
use crate::error::HandlerError;
use crate::error::RetriesExhausted;
use crate::metrics::MetricsSink;
use crate::metrics::RetryMetricEvent;
use crate::policy::RetryAction;
use crate::policy::RetryPolicy;
use crate::policy::Subscription;
use crate::producer::NonBlockingRetryProducer;
use crate::record::ConsumerRecord;
use crate::state::BlockingStateStore;

/// The user-supplied business logic this crate wraps with retry behaviour.
///
/// Implementations distinguish transient faults ([`HandlerError::Retriable`]) from
/// permanent ones ([`HandlerError::NonRetriable`]) so the dispatcher knows which records
/// are worth retrying at all (§4.1).
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Process a single record.
    async fn apply(&self, record: &ConsumerRecord) -> Result<(), HandlerError>;
}

/// Wraps a [`RecordHandler`] with the retry behaviour configured by a [`RetryConfig`] (§4.6).
///
/// Construct with [`with_retries`]. This is the only type application code needs to hold
/// on to: its [`RetryRecordHandler::handle`] method is the dispatcher's entire surface.
pub struct RetryRecordHandler {
    user_handler: Arc<dyn RecordHandler>,
    policy: RetryPolicy,
    producer: NonBlockingRetryProducer,
    store: Arc<BlockingStateStore>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    blocking: BlockingRetryLoop,
}

/// Wrap `user_handler` with the retry behaviour described by `config` (§1, §4.6).
///
/// `subscription` identifies the primary topic and consumer group, used both to name
/// retry topics and to recognise records arriving back from one. `store` is typically
/// shared across every partition-local handler of the same subscription so operator
/// overrides (§4.3) apply uniformly.
pub fn with_retries(
    user_handler: Arc<dyn RecordHandler>,
    subscription: Subscription,
    config: RetryConfig,
    producer: NonBlockingRetryProducer,
    store: Arc<BlockingStateStore>,
    metrics: Arc<dyn MetricsSink>,
) -> RetryRecordHandler {
    RetryRecordHandler::new(user_handler, subscription, config, producer, store, metrics, Arc::new(SystemClock))
}

impl RetryRecordHandler {
    /// Like [`with_retries`] but with an injectable [`Clock`], for tests that need
    /// deterministic control over retry-topic delay waits.
    pub fn new(
        user_handler: Arc<dyn RecordHandler>,
        subscription: Subscription,
        config: RetryConfig,
        producer: NonBlockingRetryProducer,
        store: Arc<BlockingStateStore>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> RetryRecordHandler {
        let policy = RetryPolicy::new(subscription, config);
        let blocking = BlockingRetryLoop::new(clock.clone(), store.clone(), metrics.clone());
        RetryRecordHandler {
            user_handler,
            policy,
            producer,
            store,
            metrics,
            clock,
            blocking,
        }
    }

    /// Dispatch `record`, applying the configured retry behaviour on failure (§4.6).
    ///
    /// Returns `Err` only when the record must not be considered consumed yet (a
    /// malformed retry header, or a republish that itself failed to produce): callers
    /// should not advance the consumer offset in that case, so the broker redelivers.
    /// Every other outcome — success, a permanent failure, or a retry schedule fully
    /// spent — is `Ok(())`: the record is consumed.
    pub async fn handle(&self, context: &Context, record: ConsumerRecord) -> anyhow::Result<()> {
        match self.policy.subscription().retry_attempt_of(&record.topic) {
            Some(attempt) => self.handle_retry_topic_record(context, record, attempt).await,
            None => self.handle_primary_topic_record(context, record).await,
        }
    }

    async fn handle_primary_topic_record(&self, context: &Context, record: ConsumerRecord) -> anyhow::Result<()> {
        let _ = self.policy.arrival_action();
        match self.user_handler.apply(&record).await {
            Ok(()) => Ok(()),
            Err(err @ HandlerError::NonRetriable(_)) => {
                self.report_non_retriable(&record, &err);
                Ok(())
            }
            Err(HandlerError::Retriable(_)) => {
                let action = self.policy.primary_failure_action();
                self.dispatch_action(context, record, action).await
            }
        }
    }

    async fn handle_retry_topic_record(&self, context: &Context, record: ConsumerRecord, attempt: u32) -> anyhow::Result<()> {
        let headers = match crate::header::decode(&record.headers) {
            Ok(Some(headers)) => headers,
            Ok(None) => {
                slog::warn!(context.logger, "Retry topic record is missing its scheduling headers"; "topic" => &record.topic, "offset" => record.offset);
                return Ok(());
            }
            Err(err) => {
                slog::warn!(context.logger, "Retry topic record carries malformed scheduling headers"; "topic" => &record.topic, "offset" => record.offset, "cause" => %err);
                return Ok(());
            }
        };

        let elapsed = self.clock.now() - headers.submitted_at;
        let elapsed = std::time::Duration::try_from(elapsed).unwrap_or_default();
        if let Some(remaining) = headers.backoff.checked_sub(elapsed) {
            if !remaining.is_zero() {
                self.clock.sleep(remaining).await;
            }
        }

        let _ = self.policy.arrival_action();
        match self.user_handler.apply(&record).await {
            Ok(()) => Ok(()),
            Err(err @ HandlerError::NonRetriable(_)) => {
                self.report_non_retriable(&record, &err);
                Ok(())
            }
            Err(HandlerError::Retriable(_)) => {
                let action = self.policy.non_blocking_action(attempt + 1);
                self.dispatch_action(context, record, action).await
            }
        }
    }

    async fn dispatch_action(&self, context: &Context, record: ConsumerRecord, action: RetryAction) -> anyhow::Result<()> {
        match action {
            RetryAction::BlockingRetry { duration, attempt } => {
                let record_for_handoff = record.clone();
                match self.blocking.run(self.user_handler.as_ref(), &self.policy, record, attempt, duration).await {
                    BlockingOutcome::Succeeded | BlockingOutcome::NonRetriable(_) => Ok(()),
                    BlockingOutcome::GaveUp { attempts } => {
                        slog::warn!(context.logger, "Blocking retry schedule exhausted, holding back offset"; "topic" => &record_for_handoff.topic, "offset" => record_for_handoff.offset, "attempts" => attempts);
                        Err(RetriesExhausted { attempts }.into())
                    }
                    BlockingOutcome::HandOff { topic, attempt, backoff } => {
                        self.republish(context, &record_for_handoff, topic, attempt, backoff).await
                    }
                }
            }
            RetryAction::NonBlockingRepublish { topic, attempt, backoff } => self.republish(context, &record, topic, attempt, backoff).await,
            RetryAction::TerminalGiveUp => {
                slog::info!(context.logger, "Retry schedule exhausted, giving up"; "topic" => &record.topic, "offset" => record.offset);
                Ok(())
            }
            RetryAction::RunUserHandler => unreachable!("RetryPolicy never returns RunUserHandler as a post-failure action"),
        }
    }

    async fn republish(&self, context: &Context, record: &ConsumerRecord, topic: String, attempt: u32, backoff: std::time::Duration) -> anyhow::Result<()> {
        let submitted_at = self.clock.now();
        match self.producer.republish(record, topic.clone(), attempt, backoff, submitted_at).await {
            Ok(()) => Ok(()),
            Err(err) => {
                slog::warn!(context.logger, "Failed to republish record to retry topic"; "topic" => %topic, "cause" => %err);
                Err(err.into())
            }
        }
    }

    fn report_non_retriable(&self, record: &ConsumerRecord, err: &HandlerError) {
        self.metrics.report(RetryMetricEvent::NoRetryOnNonRetryableFailure {
            topic_partition: record.topic_partition(),
            offset: record.offset,
            cause: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::DurationMillis;
    use crate::metrics::MetricsFixture;
    use crate::producer::NonBlockingRetryProducer;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct CountingHandler {
        remaining_failures: AtomicU32,
        non_retriable: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RecordHandler for CountingHandler {
        async fn apply(&self, _record: &ConsumerRecord) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            if self.remaining_failures.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)).is_ok() {
                if self.non_retriable {
                    return Err(HandlerError::non_retriable(anyhow::anyhow!("bad")));
                }
                return Err(HandlerError::retriable(anyhow::anyhow!("transient")));
            }
            Ok(())
        }
    }

    fn record(topic: &str) -> ConsumerRecord {
        ConsumerRecord {
            topic: topic.to_string(),
            partition: 0,
            offset: 1,
            key: None,
            value: b"payload".to_vec(),
            headers: Vec::new(),
        }
    }

    fn millis(values: &[u64]) -> Vec<DurationMillis> {
        values.iter().map(|v| DurationMillis::from(Duration::from_millis(*v))).collect()
    }

    #[tokio::test]
    async fn s1_success_on_first_attempt_never_touches_retry_machinery() {
        let handler = Arc::new(CountingHandler {
            remaining_failures: AtomicU32::new(0),
            non_retriable: false,
            calls: AtomicU32::new(0),
        });
        let metrics = Arc::new(MetricsFixture::new());
        let dispatcher = RetryRecordHandler::new(
            handler.clone(),
            Subscription::new("orders", "billing"),
            RetryConfig::FiniteBlockingRetry { backoff: millis(&[10]) },
            NonBlockingRetryProducer::fixture().backend().into(),
            Arc::new(BlockingStateStore::new()),
            metrics.clone(),
            Arc::new(SystemClock),
        );

        dispatcher.handle(&Context::fixture(), record("orders")).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::Acquire), 1);
        assert!(metrics.events().is_empty());
    }

    #[tokio::test]
    async fn s2_non_retriable_failure_is_consumed_without_retry() {
        let handler = Arc::new(CountingHandler {
            remaining_failures: AtomicU32::new(1),
            non_retriable: true,
            calls: AtomicU32::new(0),
        });
        let metrics = Arc::new(MetricsFixture::new());
        let dispatcher = RetryRecordHandler::new(
            handler.clone(),
            Subscription::new("orders", "billing"),
            RetryConfig::NonBlockingRetry { backoff: millis(&[1_000]) },
            NonBlockingRetryProducer::fixture().backend().into(),
            Arc::new(BlockingStateStore::new()),
            metrics.clone(),
            Arc::new(SystemClock),
        );

        dispatcher.handle(&Context::fixture(), record("orders")).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::Acquire), 1);
        assert!(matches!(
            metrics.events().as_slice(),
            [RetryMetricEvent::NoRetryOnNonRetryableFailure { .. }]
        ));
    }

    #[tokio::test]
    async fn s4_primary_failure_republishes_to_first_retry_topic() {
        let handler = Arc::new(CountingHandler {
            remaining_failures: AtomicU32::new(1),
            non_retriable: false,
            calls: AtomicU32::new(0),
        });
        let metrics = Arc::new(MetricsFixture::new());
        let producer_fixture = NonBlockingRetryProducer::fixture();
        let mut popper = producer_fixture.clone();
        let dispatcher = RetryRecordHandler::new(
            handler.clone(),
            Subscription::new("orders", "billing"),
            RetryConfig::NonBlockingRetry { backoff: millis(&[1_000]) },
            producer_fixture.backend().into(),
            Arc::new(BlockingStateStore::new()),
            metrics,
            Arc::new(SystemClock),
        );

        dispatcher.handle(&Context::fixture(), record("orders")).await.unwrap();
        let published = popper.pop().await.unwrap();
        assert_eq!(published.topic, "orders-billing-retry-0");
        let decoded = crate::header::decode(&published.record.headers).unwrap().unwrap();
        assert_eq!(decoded.attempt, 0);
        assert_eq!(decoded.backoff, Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn s5_retry_topic_record_waits_out_remaining_backoff_then_succeeds() {
        let handler = Arc::new(CountingHandler {
            remaining_failures: AtomicU32::new(0),
            non_retriable: false,
            calls: AtomicU32::new(0),
        });
        let metrics = Arc::new(MetricsFixture::new());
        let dispatcher = RetryRecordHandler::new(
            handler.clone(),
            Subscription::new("orders", "billing"),
            RetryConfig::NonBlockingRetry { backoff: millis(&[1_000]) },
            NonBlockingRetryProducer::fixture().backend().into(),
            Arc::new(BlockingStateStore::new()),
            metrics,
            Arc::new(SystemClock),
        );

        let mut retry_record = record("orders-billing-retry-0");
        let submitted_at = time::OffsetDateTime::now_utc();
        crate::header::encode(&mut retry_record.headers, 0, submitted_at, Duration::from_millis(1_000));

        let run = tokio::spawn({
            let context = Context::fixture();
            async move { dispatcher.handle(&context, retry_record).await }
        });
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1_001)).await;
        tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap().unwrap();
        assert_eq!(handler.calls.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn s6_retry_topic_record_with_malformed_headers_is_consumed() {
        let handler = Arc::new(CountingHandler {
            remaining_failures: AtomicU32::new(0),
            non_retriable: false,
            calls: AtomicU32::new(0),
        });
        let metrics = Arc::new(MetricsFixture::new());
        let dispatcher = RetryRecordHandler::new(
            handler.clone(),
            Subscription::new("orders", "billing"),
            RetryConfig::NonBlockingRetry { backoff: millis(&[1_000]) },
            NonBlockingRetryProducer::fixture().backend().into(),
            Arc::new(BlockingStateStore::new()),
            metrics,
            Arc::new(SystemClock),
        );

        let mut retry_record = record("orders-billing-retry-0");
        retry_record.headers.push((crate::header::ATTEMPT.to_string(), b"garbage".to_vec()));

        dispatcher.handle(&Context::fixture(), retry_record).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn s7_retry_topic_record_exhausts_schedule_and_gives_up() {
        let handler = Arc::new(CountingHandler {
            remaining_failures: AtomicU32::new(u32::MAX),
            non_retriable: false,
            calls: AtomicU32::new(0),
        });
        let metrics = Arc::new(MetricsFixture::new());
        let dispatcher = RetryRecordHandler::new(
            handler.clone(),
            Subscription::new("orders", "billing"),
            RetryConfig::NonBlockingRetry { backoff: millis(&[1_000]) },
            NonBlockingRetryProducer::fixture().backend().into(),
            Arc::new(BlockingStateStore::new()),
            metrics,
            Arc::new(SystemClock),
        );

        // Attempt 0 (last configured hop) fails again: the policy has nothing further.
        let mut retry_record = record("orders-billing-retry-0");
        crate::header::encode(&mut retry_record.headers, 0, time::OffsetDateTime::now_utc(), Duration::from_millis(0));
        dispatcher.handle(&Context::fixture(), retry_record).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::Acquire), 1);
    }
}
