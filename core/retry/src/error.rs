//! Errors reported by the retry dispatcher core.
use anyhow::Error;

/// The semantic outcome of a user handler (or producer) invocation.
///
/// Callers of [`crate::handler::RecordHandler::apply`] and
/// [`crate::producer::RetryProducer::produce`] must distinguish these two cases: only
/// [`HandlerError::Retriable`] is subject to the configured retry policy.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A transient fault. Subject to the active [`crate::conf::RetryConfig`].
    #[error(transparent)]
    Retriable(#[from] Error),

    /// A permanent fault. Never retried, consumed with a metric instead.
    #[error("non-retriable failure: {0}")]
    NonRetriable(Error),
}

impl HandlerError {
    /// Wrap an arbitrary cause as a non-retriable failure.
    pub fn non_retriable<E>(cause: E) -> HandlerError
    where
        E: Into<Error>,
    {
        HandlerError::NonRetriable(cause.into())
    }

    /// Wrap an arbitrary cause as a retriable failure.
    pub fn retriable<E>(cause: E) -> HandlerError
    where
        E: Into<Error>,
    {
        HandlerError::Retriable(cause.into())
    }
}

/// Retry headers were present but could not be decoded.
///
/// Decode failures are always treated as [`HandlerError::NonRetriable`] (§4.1): a
/// malformed retry header is a permanent, unrecoverable fault about the record itself.
#[derive(Debug, thiserror::Error)]
pub enum HeaderDecodeError {
    /// The `retry-attempt` header was present but not a valid 32-bit big-endian integer.
    #[error("malformed '{}' header", crate::header::ATTEMPT)]
    Attempt,

    /// The `retry-backoff` header was present but not a valid 64-bit big-endian integer.
    #[error("malformed '{}' header", crate::header::BACKOFF)]
    Backoff,

    /// The `retry-submitted-at` header was present but not a valid RFC 3339 timestamp.
    #[error("malformed '{}' header", crate::header::SUBMITTED_AT)]
    SubmittedAt,

    /// Only some of the three retry headers were present.
    ///
    /// A retry record is defined by the presence of all three headers together; a
    /// partial set means upstream production logic is broken.
    #[error("retry headers are only partially present")]
    Partial,
}

/// The blocking retry schedule was exhausted without the handler ever succeeding.
#[derive(Debug, thiserror::Error)]
#[error("blocking retry schedule exhausted after {attempts} attempt(s)")]
pub struct RetriesExhausted {
    /// Number of blocking attempts made before giving up.
    pub attempts: u32,
}
