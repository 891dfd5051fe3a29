//! Classify incoming records and decide the next retry action (§4.2).
use std::time::Duration;

use crate::conf::RetryConfig;

/// Identifies the subscription this dispatcher is attached to: the primary topic and
/// the consumer group, which together determine retry topic names (§4.2) and whether an
/// incoming record is itself a retry-topic record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    /// The primary topic records are consumed from.
    pub topic: String,

    /// The consumer group this dispatcher runs as.
    pub group: String,
}

impl Subscription {
    /// Build a subscription for `topic` consumed as `group`.
    pub fn new<S1: Into<String>, S2: Into<String>>(topic: S1, group: S2) -> Self {
        Subscription {
            topic: topic.into(),
            group: group.into(),
        }
    }

    /// The contractual name of the retry topic for the given attempt index (§4.2, §6):
    /// `<original-topic>-<consumer-group>-retry-<attempt-index>`.
    pub fn retry_topic_name(&self, attempt: u32) -> String {
        format!("{}-{}-retry-{}", self.topic, self.group, attempt)
    }

    /// If `topic` is one of this subscription's retry topics, the attempt index it
    /// corresponds to.
    pub fn retry_attempt_of(&self, topic: &str) -> Option<u32> {
        let prefix = format!("{}-{}-retry-", self.topic, self.group);
        topic.strip_prefix(&prefix).and_then(|suffix| suffix.parse().ok())
    }
}

/// The action the dispatcher should take next, as decided by the [`RetryPolicy`].
#[derive(Clone, Debug, PartialEq)]
pub enum RetryAction {
    /// Invoke the user handler now.
    RunUserHandler,

    /// Retry in-place, sleeping `duration` before reinvoking the handler.
    BlockingRetry { duration: Duration, attempt: u32 },

    /// Republish the record to `topic` with the given scheduling headers.
    NonBlockingRepublish {
        topic: String,
        attempt: u32,
        backoff: Duration,
    },

    /// Exhausted every configured retry; surface the failure to the caller.
    TerminalGiveUp,
}

/// Classifies records against a [`RetryConfig`] and produces [`RetryAction`]s (§4.2).
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    subscription: Subscription,
    config: RetryConfig,
}

impl RetryPolicy {
    /// Build a policy for `subscription` governed by `config`.
    pub fn new(subscription: Subscription, config: RetryConfig) -> Self {
        RetryPolicy { subscription, config }
    }

    /// The subscription this policy was built for.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// The configuration this policy was built for.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The classification of a record that is ready to be handed to the user handler.
    ///
    /// This is always [`RetryAction::RunUserHandler`] (rule 1: the policy only has an
    /// opinion once the handler has failed); kept as an explicit step so the dispatcher
    /// (§4.6) performs a single exhaustive match over [`RetryAction`] rather than special
    /// casing the "no failure yet" path.
    pub fn arrival_action(&self) -> RetryAction {
        RetryAction::RunUserHandler
    }

    /// The first action to take when a record on the **primary** topic fails retriably.
    ///
    /// Blocking-capable configurations (rule 2/3) start their blocking sequence;
    /// `NonBlockingRetry` configurations republish directly at attempt 0.
    pub fn primary_failure_action(&self) -> RetryAction {
        match &self.config {
            RetryConfig::FiniteBlockingRetry { backoff } | RetryConfig::BlockingFollowedByNonBlocking { blocking: backoff, .. } => {
                match backoff.first() {
                    Some(duration) => RetryAction::BlockingRetry {
                        duration: (*duration).into(),
                        attempt: 0,
                    },
                    None => self.non_blocking_action(0),
                }
            }
            RetryConfig::InfiniteBlockingRetry { backoff } => RetryAction::BlockingRetry {
                duration: (*backoff).into(),
                attempt: 0,
            },
            RetryConfig::NonBlockingRetry { .. } => self.non_blocking_action(0),
        }
    }

    /// The action to take after a blocking attempt numbered `attempt` (0-indexed) has
    /// just failed retriably: either the next blocking duration, a handoff to
    /// non-blocking retries (`BlockingFollowedByNonBlocking` only), or giving up.
    pub fn next_blocking_action(&self, attempt: u32) -> RetryAction {
        let next = attempt as usize + 1;
        match self.config.blocking_backoff() {
            Some(sequence) => match sequence.get(next) {
                Some(duration) => RetryAction::BlockingRetry {
                    duration: (*duration).into(),
                    attempt: next as u32,
                },
                None => match &self.config {
                    RetryConfig::BlockingFollowedByNonBlocking { .. } => self.non_blocking_action(0),
                    _ => RetryAction::TerminalGiveUp,
                },
            },
            None => RetryAction::TerminalGiveUp,
        }
    }

    /// The action to take for the non-blocking attempt numbered `attempt` (0-indexed):
    /// republish if the sequence has an entry for it, otherwise give up.
    ///
    /// Used both to start non-blocking retries (attempt 0) and, by the caller, to
    /// advance after a retry-topic record fails again.
    pub fn non_blocking_action(&self, attempt: u32) -> RetryAction {
        match self.config.non_blocking_backoff().and_then(|seq| seq.get(attempt as usize)) {
            Some(backoff) => RetryAction::NonBlockingRepublish {
                topic: self.subscription.retry_topic_name(attempt),
                attempt,
                backoff: (*backoff).into(),
            },
            None => RetryAction::TerminalGiveUp,
        }
    }
}
