//! Retry policy configuration shapes.
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Configured retry behaviour for a subscription.
///
/// See the [crate root docs](crate) for how each variant drives the
/// [`crate::policy::RetryPolicy`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum RetryConfig {
    /// Republish failed records to a chain of retry topics with increasing delay.
    NonBlockingRetry {
        /// Backoff to wait on the retry topic before each attempt, one per hop.
        backoff: Vec<DurationMillis>,
    },

    /// Retry in-place on the consuming partition a fixed number of times.
    FiniteBlockingRetry {
        /// Backoff to sleep before each in-place retry attempt.
        backoff: Vec<DurationMillis>,
    },

    /// Retry in-place on the consuming partition forever, at a fixed cadence.
    InfiniteBlockingRetry {
        /// Backoff to sleep before every in-place retry attempt.
        backoff: DurationMillis,
    },

    /// Retry in-place first; once that schedule is exhausted, switch to non-blocking
    /// republishing.
    BlockingFollowedByNonBlocking {
        /// Backoff to sleep before each in-place retry attempt.
        blocking: Vec<DurationMillis>,

        /// Backoff to wait on the retry topic once non-blocking retries begin.
        non_blocking: Vec<DurationMillis>,
    },
}

impl RetryConfig {
    /// The blocking backoff sequence for this configuration, if it has one.
    pub fn blocking_backoff(&self) -> Option<&[DurationMillis]> {
        match self {
            RetryConfig::NonBlockingRetry { .. } => None,
            RetryConfig::FiniteBlockingRetry { backoff } => Some(backoff),
            RetryConfig::InfiniteBlockingRetry { .. } => None,
            RetryConfig::BlockingFollowedByNonBlocking { blocking, .. } => Some(blocking),
        }
    }

    /// The non-blocking backoff sequence for this configuration, if it has one.
    pub fn non_blocking_backoff(&self) -> Option<&[DurationMillis]> {
        match self {
            RetryConfig::NonBlockingRetry { backoff } => Some(backoff),
            RetryConfig::FiniteBlockingRetry { .. } => None,
            RetryConfig::InfiniteBlockingRetry { .. } => None,
            RetryConfig::BlockingFollowedByNonBlocking { non_blocking, .. } => Some(non_blocking),
        }
    }
}

/// A [`Duration`] that (de)serializes as a plain number of milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationMillis(u64);

impl DurationMillis {
    /// Build from a [`Duration`], truncating to whole milliseconds.
    pub fn new(duration: Duration) -> Self {
        DurationMillis(duration.as_millis() as u64)
    }
}

impl From<Duration> for DurationMillis {
    fn from(duration: Duration) -> Self {
        DurationMillis::new(duration)
    }
}

impl From<DurationMillis> for Duration {
    fn from(value: DurationMillis) -> Self {
        Duration::from_millis(value.0)
    }
}
