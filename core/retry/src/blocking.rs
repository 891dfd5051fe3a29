//! The Blocking Retry Loop: in-place retries that hold a partition while they sleep (§4.4).
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::conf::RetryConfig;
use crate::error::HandlerError;
use crate::handler::RecordHandler;
use crate::metrics::MetricsSink;
use crate::metrics::RetryMetricEvent;
use crate::policy::RetryAction;
use crate::policy::RetryPolicy;
use crate::record::ConsumerRecord;
use crate::state::BlockedRecord;
use crate::state::BlockingState;
use crate::state::BlockingStateStore;
use crate::state::BlockingTarget;

/// How the loop concluded.
#[derive(Debug)]
pub enum BlockingOutcome {
    /// The handler eventually succeeded.
    Succeeded,

    /// The handler failed non-retriably; the record was consumed without further retry.
    NonRetriable(HandlerError),

    /// The blocking schedule was exhausted with no non-blocking follow-up configured.
    GaveUp { attempts: u32 },

    /// The blocking schedule was exhausted; the record should be republished to a retry
    /// topic with these scheduling headers (`BlockingFollowedByNonBlocking` only).
    HandOff {
        topic: String,
        attempt: u32,
        backoff: Duration,
    },
}

/// What the next iteration of the wait loop should do.
enum Turn {
    /// The configured delay elapsed without an overriding change; invoke the handler.
    Fire,
    /// A consume-once override was in effect; the attempt is skipped and consumed.
    SkipOnce,
}

/// Which target is currently governing the partition, and with what severity.
enum Effective {
    Blocking,
    IgnoringOnce(BlockingTarget),
    IgnoringAll,
}

/// Retries a record in-place on its own partition, holding it in the
/// [`BlockingStateStore`] while it sleeps between attempts (§4.4).
pub struct BlockingRetryLoop {
    clock: Arc<dyn Clock>,
    store: Arc<BlockingStateStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl BlockingRetryLoop {
    /// Build a loop sharing `clock`, `store` and `metrics` with the rest of the dispatcher.
    pub fn new(clock: Arc<dyn Clock>, store: Arc<BlockingStateStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        BlockingRetryLoop { clock, store, metrics }
    }

    /// Run the loop for `record`, starting at `first_attempt` with `first_duration`.
    ///
    /// Returns once the handler succeeds, fails non-retriably, the schedule is exhausted,
    /// or exhaustion hands off to a non-blocking republish.
    pub async fn run(
        &self,
        handler: &dyn RecordHandler,
        policy: &RetryPolicy,
        record: ConsumerRecord,
        first_attempt: u32,
        first_duration: Duration,
    ) -> BlockingOutcome {
        let partition_target = BlockingTarget::TopicPartition(record.topic_partition());
        let topic_target = BlockingTarget::Topic(record.topic.clone());
        let mut attempt = first_attempt;
        let mut duration = first_duration;

        loop {
            match self.await_turn(&record, &partition_target, &topic_target, duration).await {
                Turn::SkipOnce => {
                    self.metrics.report(RetryMetricEvent::BlockingIgnoredOnceFor {
                        topic_partition: record.topic_partition(),
                        offset: record.offset,
                    });
                    match self.advance(policy, attempt) {
                        RetryAction::BlockingRetry { duration: d, attempt: a } => {
                            duration = d;
                            attempt = a;
                        }
                        other => return self.conclude(&partition_target, attempt, other),
                    }
                }
                Turn::Fire => match handler.apply(&record).await {
                    Ok(()) => {
                        self.store.set(partition_target, BlockingState::Blocking);
                        return BlockingOutcome::Succeeded;
                    }
                    Err(err @ HandlerError::NonRetriable(_)) => {
                        self.metrics.report(RetryMetricEvent::NoRetryOnNonRetryableFailure {
                            topic_partition: record.topic_partition(),
                            offset: record.offset,
                            cause: err.to_string(),
                        });
                        self.store.set(partition_target, BlockingState::Blocking);
                        return BlockingOutcome::NonRetriable(err);
                    }
                    Err(HandlerError::Retriable(_)) => {
                        self.metrics.report(RetryMetricEvent::BlockingRetryHandlerInvocationFailed {
                            topic_partition: record.topic_partition(),
                            offset: record.offset,
                        });
                        match self.advance(policy, attempt) {
                            RetryAction::BlockingRetry { duration: d, attempt: a } => {
                                duration = d;
                                attempt = a;
                            }
                            other => return self.conclude(&partition_target, attempt, other),
                        }
                    }
                },
            }
        }
    }

    /// Turn a non-`BlockingRetry` [`RetryAction`] reached while blocking into the loop's
    /// final outcome, releasing the partition first. `attempt` is the 0-indexed blocking
    /// attempt that just concluded, used to report how many attempts were made on give-up.
    fn conclude(&self, partition_target: &BlockingTarget, attempt: u32, action: RetryAction) -> BlockingOutcome {
        self.store.set(partition_target.clone(), BlockingState::Blocking);
        match action {
            RetryAction::NonBlockingRepublish { topic, attempt, backoff } => {
                BlockingOutcome::HandOff { topic, attempt, backoff }
            }
            RetryAction::TerminalGiveUp => BlockingOutcome::GaveUp { attempts: attempt + 1 },
            RetryAction::RunUserHandler | RetryAction::BlockingRetry { .. } => unreachable!(
                "conclude is only called with the non-BlockingRetry branch of RetryPolicy::next_blocking_action"
            ),
        }
    }

    /// The action to take after the blocking attempt numbered `attempt` just concluded
    /// (whether by failure or by an `IgnoringOnce` skip).
    ///
    /// `InfiniteBlockingRetry` has no stored sequence for [`RetryPolicy::next_blocking_action`]
    /// to walk, so it is special-cased here to keep repeating its single duration forever.
    fn advance(&self, policy: &RetryPolicy, attempt: u32) -> RetryAction {
        if let RetryConfig::InfiniteBlockingRetry { backoff } = policy.config() {
            return RetryAction::BlockingRetry {
                duration: (*backoff).into(),
                attempt: attempt + 1,
            };
        }
        policy.next_blocking_action(attempt)
    }

    /// Wait for either `duration` to elapse or an operator override to decide the attempt
    /// for us, re-evaluating after every wake (§9: no missed wakeup, no busy polling).
    ///
    /// Overrides are read (steps 1-2) before `Blocked` is ever written for this attempt
    /// (step 3): a pre-existing `IgnoringOnce`/`IgnoringAll` on either target must be
    /// observed and consumed before the loop claims the partition, otherwise writing
    /// `Blocked` would clobber it.
    async fn await_turn(&self, record: &ConsumerRecord, partition_target: &BlockingTarget, topic_target: &BlockingTarget, duration: Duration) -> Turn {
        loop {
            match self.effective_state(partition_target, topic_target) {
                Effective::IgnoringAll => {
                    tokio::select! {
                        _ = self.store.wait_for_change(partition_target) => {}
                        _ = self.store.wait_for_change(topic_target) => {}
                    }
                }
                Effective::IgnoringOnce(holder) => {
                    self.store.compare_and_set(&holder, &BlockingState::IgnoringOnce, BlockingState::Blocking);
                    return Turn::SkipOnce;
                }
                Effective::Blocking => {
                    self.store.set(
                        partition_target.clone(),
                        BlockingState::Blocked(BlockedRecord {
                            key: record.key.clone(),
                            value: record.value.clone(),
                            headers: record.headers.clone(),
                            topic_partition: record.topic_partition(),
                            offset: record.offset,
                        }),
                    );
                    tokio::select! {
                        _ = self.clock.sleep(duration) => return Turn::Fire,
                        _ = self.store.wait_for_change(partition_target) => {}
                        _ = self.store.wait_for_change(topic_target) => {}
                    }
                }
            }
        }
    }

    /// The state actually governing `partition_target` right now, after resolving the
    /// partition- and topic-scoped overrides by severity (`IgnoringAll` beats
    /// `IgnoringOnce` beats neither, regardless of which target carries it). The loop's
    /// own [`BlockingState::Blocked`] bookkeeping on the partition target is not an
    /// override and reads as [`BlockingState::Blocking`].
    fn effective_state(&self, partition_target: &BlockingTarget, topic_target: &BlockingTarget) -> Effective {
        let partition_state = match self.store.get(partition_target) {
            BlockingState::Blocked(_) => BlockingState::Blocking,
            other => other,
        };
        let topic_state = self.store.get(topic_target);

        if partition_state == BlockingState::IgnoringAll || topic_state == BlockingState::IgnoringAll {
            return Effective::IgnoringAll;
        }
        if partition_state == BlockingState::IgnoringOnce {
            return Effective::IgnoringOnce(partition_target.clone());
        }
        if topic_state == BlockingState::IgnoringOnce {
            return Effective::IgnoringOnce(topic_target.clone());
        }
        Effective::Blocking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::conf::DurationMillis;
    use crate::policy::Subscription;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;

    struct FailNTimes {
        remaining_failures: AtomicU32,
    }

    #[async_trait]
    impl RecordHandler for FailNTimes {
        async fn apply(&self, _record: &ConsumerRecord) -> Result<(), HandlerError> {
            if self.remaining_failures.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)).is_ok() {
                return Err(HandlerError::retriable(anyhow::anyhow!("not yet")));
            }
            Ok(())
        }
    }

    struct AlwaysNonRetriable;

    #[async_trait]
    impl RecordHandler for AlwaysNonRetriable {
        async fn apply(&self, _record: &ConsumerRecord) -> Result<(), HandlerError> {
            Err(HandlerError::non_retriable(anyhow::anyhow!("bad input")))
        }
    }

    fn record() -> ConsumerRecord {
        ConsumerRecord {
            topic: "orders".into(),
            partition: 0,
            offset: 42,
            key: None,
            value: b"payload".to_vec(),
            headers: Vec::new(),
        }
    }

    fn millis(values: &[u64]) -> Vec<DurationMillis> {
        values.iter().map(|v| DurationMillis::from(Duration::from_millis(*v))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_enough_attempts() {
        let store = Arc::new(BlockingStateStore::new());
        let metrics = Arc::new(crate::metrics::MetricsFixture::new());
        let retry = BlockingRetryLoop::new(Arc::new(SystemClock), store.clone(), metrics.clone());
        let policy = RetryPolicy::new(
            Subscription::new("orders", "billing"),
            RetryConfig::FiniteBlockingRetry { backoff: millis(&[10, 10, 10]) },
        );
        let handler = FailNTimes { remaining_failures: AtomicU32::new(2) };

        let run = tokio::spawn(async move {
            let first = policy.primary_failure_action();
            let RetryAction::BlockingRetry { duration, attempt } = first else { panic!("expected BlockingRetry") };
            retry.run(&handler, &policy, record(), attempt, duration).await
        });

        tokio::time::advance(Duration::from_millis(11)).await;
        tokio::time::advance(Duration::from_millis(11)).await;
        let outcome = tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        assert!(matches!(outcome, BlockingOutcome::Succeeded));
        assert_eq!(store.get(&BlockingTarget::TopicPartition(record().topic_partition())), BlockingState::Blocking);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_failure_stops_immediately() {
        let store = Arc::new(BlockingStateStore::new());
        let metrics = Arc::new(crate::metrics::MetricsFixture::new());
        let retry = BlockingRetryLoop::new(Arc::new(SystemClock), store, metrics.clone());
        let policy = RetryPolicy::new(
            Subscription::new("orders", "billing"),
            RetryConfig::FiniteBlockingRetry { backoff: millis(&[10]) },
        );
        let handler = AlwaysNonRetriable;

        let outcome = retry.run(&handler, &policy, record(), 0, Duration::from_millis(10)).await;
        assert!(matches!(outcome, BlockingOutcome::NonRetriable(_)));
        assert_eq!(
            metrics.events(),
            vec![RetryMetricEvent::NoRetryOnNonRetryableFailure {
                topic_partition: record().topic_partition(),
                offset: 42,
                cause: "bad input".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ignoring_once_skips_exactly_one_attempt() {
        let store = Arc::new(BlockingStateStore::new());
        let metrics = Arc::new(crate::metrics::MetricsFixture::new());
        let retry = BlockingRetryLoop::new(Arc::new(SystemClock), store.clone(), metrics.clone());
        let policy = RetryPolicy::new(
            Subscription::new("orders", "billing"),
            RetryConfig::FiniteBlockingRetry { backoff: millis(&[10, 10]) },
        );
        let handler = FailNTimes { remaining_failures: AtomicU32::new(0) };
        let partition_target = BlockingTarget::TopicPartition(record().topic_partition());
        store.set(partition_target.clone(), BlockingState::IgnoringOnce);

        let outcome = retry.run(&handler, &policy, record(), 0, Duration::from_millis(10)).await;
        assert!(matches!(outcome, BlockingOutcome::Succeeded));
        assert_eq!(
            metrics.events(),
            vec![RetryMetricEvent::BlockingIgnoredOnceFor {
                topic_partition: record().topic_partition(),
                offset: 42,
            }]
        );
        // Consumed: a second IgnoringOnce write would be required to skip again.
        assert_eq!(store.get(&partition_target), BlockingState::Blocking);
    }

    #[tokio::test(start_paused = true)]
    async fn ignoring_all_pauses_until_released() {
        let store = Arc::new(BlockingStateStore::new());
        let metrics = Arc::new(crate::metrics::MetricsFixture::new());
        let retry = BlockingRetryLoop::new(Arc::new(SystemClock), store.clone(), metrics.clone());
        let policy = RetryPolicy::new(
            Subscription::new("orders", "billing"),
            RetryConfig::FiniteBlockingRetry { backoff: millis(&[10]) },
        );
        let handler = FailNTimes { remaining_failures: AtomicU32::new(0) };
        let partition_target = BlockingTarget::TopicPartition(record().topic_partition());
        store.set(partition_target.clone(), BlockingState::IgnoringAll);

        let run = tokio::spawn(async move { retry.run(&handler, &policy, record(), 0, Duration::from_millis(10)).await });

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        // Still paused: nothing has fired yet because the override was never lifted.
        assert!(!run.is_finished());

        store.set(partition_target, BlockingState::Blocking);
        let outcome = tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        assert!(matches!(outcome, BlockingOutcome::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_exhaustion_hands_off_to_non_blocking() {
        let store = Arc::new(BlockingStateStore::new());
        let metrics = Arc::new(crate::metrics::MetricsFixture::new());
        let retry = BlockingRetryLoop::new(Arc::new(SystemClock), store, metrics);
        let policy = RetryPolicy::new(
            Subscription::new("orders", "billing"),
            RetryConfig::BlockingFollowedByNonBlocking {
                blocking: millis(&[10]),
                non_blocking: millis(&[1_000]),
            },
        );
        let handler = FailNTimes { remaining_failures: AtomicU32::new(u32::MAX) };

        let run = tokio::spawn(async move { retry.run(&handler, &policy, record(), 0, Duration::from_millis(10)).await });
        tokio::time::advance(Duration::from_millis(11)).await;
        let outcome = tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        match outcome {
            BlockingOutcome::HandOff { topic, attempt, backoff } => {
                assert_eq!(topic, "orders-billing-retry-0");
                assert_eq!(attempt, 0);
                assert_eq!(backoff, Duration::from_millis(1_000));
            }
            other => panic!("expected HandOff, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finite_blocking_exhaustion_gives_up() {
        let store = Arc::new(BlockingStateStore::new());
        let metrics = Arc::new(crate::metrics::MetricsFixture::new());
        let retry = BlockingRetryLoop::new(Arc::new(SystemClock), store.clone(), metrics.clone());
        let policy = RetryPolicy::new(
            Subscription::new("orders", "billing"),
            RetryConfig::FiniteBlockingRetry { backoff: millis(&[10, 10]) },
        );
        let handler = FailNTimes { remaining_failures: AtomicU32::new(u32::MAX) };

        let run = tokio::spawn(async move { retry.run(&handler, &policy, record(), 0, Duration::from_millis(10)).await });
        tokio::time::advance(Duration::from_millis(11)).await;
        tokio::time::advance(Duration::from_millis(11)).await;
        let outcome = tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        assert!(matches!(outcome, BlockingOutcome::GaveUp { attempts: 2 }));
        assert_eq!(store.get(&BlockingTarget::TopicPartition(record().topic_partition())), BlockingState::Blocking);
    }
}
