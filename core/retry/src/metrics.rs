//! Metrics sink collaborator (§6) and the Prometheus-backed default implementation.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::CounterVec;
use prometheus::Opts;

use crate::record::TopicPartition;

/// The four metric events this crate reports, exactly as observed by tests (§6/§8).
#[derive(Clone, Debug, PartialEq)]
pub enum RetryMetricEvent {
    /// A blocking retry attempt invoked the user handler and it failed retriably.
    BlockingRetryHandlerInvocationFailed {
        topic_partition: TopicPartition,
        offset: i64,
    },

    /// A pending blocking retry was skipped by a consume-once operator override.
    BlockingIgnoredOnceFor {
        topic_partition: TopicPartition,
        offset: i64,
    },

    /// A pending blocking retry was skipped by a durable operator override.
    BlockingIgnoredForAllFor {
        topic_partition: TopicPartition,
        offset: i64,
    },

    /// A record failed non-retriably and was consumed without any retry.
    NoRetryOnNonRetryableFailure {
        topic_partition: TopicPartition,
        offset: i64,
        cause: String,
    },
}

impl RetryMetricEvent {
    fn topic(&self) -> &str {
        match self {
            RetryMetricEvent::BlockingRetryHandlerInvocationFailed { topic_partition, .. }
            | RetryMetricEvent::BlockingIgnoredOnceFor { topic_partition, .. }
            | RetryMetricEvent::BlockingIgnoredForAllFor { topic_partition, .. }
            | RetryMetricEvent::NoRetryOnNonRetryableFailure { topic_partition, .. } => {
                &topic_partition.topic
            }
        }
    }
}

/// Where [`RetryMetricEvent`]s are reported to. Fire-and-forget, no ordering guarantee.
pub trait MetricsSink: Send + Sync {
    /// Report a single event.
    fn report(&self, event: RetryMetricEvent);
}

/// Total count of blocking retry attempts that invoked the user handler and failed.
static BLOCKING_RETRY_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "replicore_retry_blocking_handler_invocation_failed",
            "Total number of blocking retry attempts that invoked the user handler and failed",
        ),
        &["topic"],
    )
    .expect("failed to initialise BLOCKING_RETRY_FAILED counter")
});

/// Total count of blocking retries skipped by a consume-once override.
static BLOCKING_IGNORED_ONCE: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "replicore_retry_blocking_ignored_once",
            "Total number of blocking retries skipped by a consume-once operator override",
        ),
        &["topic"],
    )
    .expect("failed to initialise BLOCKING_IGNORED_ONCE counter")
});

/// Total count of blocking retries skipped by a durable override.
static BLOCKING_IGNORED_ALL: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "replicore_retry_blocking_ignored_all",
            "Total number of blocking retries skipped by a durable operator override",
        ),
        &["topic"],
    )
    .expect("failed to initialise BLOCKING_IGNORED_ALL counter")
});

/// Total count of records consumed after a non-retriable failure.
static NO_RETRY_NON_RETRYABLE: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "replicore_retry_no_retry_on_non_retryable_failure",
            "Total number of records consumed after a non-retriable handler failure",
        ),
        &["topic"],
    )
    .expect("failed to initialise NO_RETRY_NON_RETRYABLE counter")
});

/// Ensure metrics are registered only once per process.
static METRICS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// The first time this is called it registers this crate's Prometheus collectors.
pub fn register_metrics(reg: &prometheus::Registry) -> Result<()> {
    if METRICS_REGISTERED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    let collectors: [Box<dyn prometheus::core::Collector>; 4] = [
        Box::new(BLOCKING_RETRY_FAILED.clone()),
        Box::new(BLOCKING_IGNORED_ONCE.clone()),
        Box::new(BLOCKING_IGNORED_ALL.clone()),
        Box::new(NO_RETRY_NON_RETRYABLE.clone()),
    ];
    for collector in collectors {
        reg.register(collector)?;
    }
    Ok(())
}

/// Reports events into the Prometheus counters registered by [`register_metrics`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PrometheusMetricsSink;

impl MetricsSink for PrometheusMetricsSink {
    fn report(&self, event: RetryMetricEvent) {
        let topic = event.topic().to_string();
        match &event {
            RetryMetricEvent::BlockingRetryHandlerInvocationFailed { .. } => {
                BLOCKING_RETRY_FAILED.with_label_values(&[&topic]).inc();
            }
            RetryMetricEvent::BlockingIgnoredOnceFor { .. } => {
                BLOCKING_IGNORED_ONCE.with_label_values(&[&topic]).inc();
            }
            RetryMetricEvent::BlockingIgnoredForAllFor { .. } => {
                BLOCKING_IGNORED_ALL.with_label_values(&[&topic]).inc();
            }
            RetryMetricEvent::NoRetryOnNonRetryableFailure { .. } => {
                NO_RETRY_NON_RETRYABLE.with_label_values(&[&topic]).inc();
            }
        }
    }
}

#[cfg(any(test, feature = "test-fixture"))]
pub use self::fixture::MetricsFixture;

#[cfg(any(test, feature = "test-fixture"))]
mod fixture {
    use std::sync::Mutex;

    use super::MetricsSink;
    use super::RetryMetricEvent;

    /// Introspection tool for events reported during unit tests.
    #[derive(Default)]
    pub struct MetricsFixture {
        events: Mutex<Vec<RetryMetricEvent>>,
    }

    impl MetricsFixture {
        /// Create an empty fixture.
        pub fn new() -> Self {
            Default::default()
        }

        /// All events reported so far, in report order.
        pub fn events(&self) -> Vec<RetryMetricEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MetricsSink for MetricsFixture {
        fn report(&self, event: RetryMetricEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
