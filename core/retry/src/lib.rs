//! Retry dispatcher for Kafka-consumed records, supporting blocking (in-place) and
//! non-blocking (retry-topic) retry strategies for the Replicante Control Plane.
//!
//! Dispatch is split across a handful of collaborators:
//!
//! - [`record`]: the `ConsumerRecord`/`TopicPartition` shapes this crate operates on.
//! - [`conf`]: the four retry strategies a subscription can be configured with.
//! - [`header`]: encode/decode the scheduling headers carried on retry-topic records.
//! - [`state`]: the `BlockingStateStore`, the operator control surface for in-place retries.
//! - [`clock`]: the injectable wall-clock/sleep collaborator.
//! - [`metrics`]: the events this crate reports and their Prometheus-backed sink.
//! - [`policy`]: classifies failures against a `RetryConfig` into the next `RetryAction`.
//! - [`blocking`]: the in-place retry loop.
//! - [`producer`]: republishes records onto retry topics.
//! - [`handler`]: [`handler::with_retries`], the entry point wrapping a user handler with
//!   all of the above.
//! - [`error`]: the error types every collaborator above communicates failure with.
pub mod blocking;
pub mod clock;
pub mod conf;
pub mod error;
pub mod handler;
pub mod header;
pub mod metrics;
pub mod policy;
pub mod producer;
pub mod record;
pub mod state;

pub use self::metrics::register_metrics;
