//! Encode/decode the retry scheduling headers carried on retry-topic records.
use std::time::Duration;

use time::OffsetDateTime;

use crate::error::HeaderDecodeError;

/// Header carrying the non-blocking attempt index, as a big-endian `i32`.
pub const ATTEMPT: &str = "retry-attempt";

/// Header carrying the instant the record was submitted to its retry topic, as an RFC
/// 3339 string.
pub const SUBMITTED_AT: &str = "retry-submitted-at";

/// Header carrying the configured backoff for this attempt, in milliseconds as a
/// big-endian `i64`.
pub const BACKOFF: &str = "retry-backoff";

/// The decoded retry scheduling headers of a retry-topic record.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryHeaders {
    /// Index into the non-blocking backoff sequence this record is on.
    pub attempt: u32,

    /// Instant the record was published to its retry topic.
    pub submitted_at: OffsetDateTime,

    /// Backoff configured for this attempt.
    pub backoff: Duration,
}

/// Append the retry scheduling headers to `headers`, removing any existing entries with
/// the same names first.
///
/// This is the only way this crate ever writes retry headers: always all three
/// together, always overwriting whatever was already there (§4.5).
pub fn encode(headers: &mut Vec<(String, Vec<u8>)>, attempt: u32, submitted_at: OffsetDateTime, backoff: Duration) {
    headers.retain(|(name, _)| !is_retry_header(name));
    headers.push((ATTEMPT.to_string(), (attempt as i32).to_be_bytes().to_vec()));
    let submitted_at = submitted_at
        .format(&time::format_description::well_known::Rfc3339)
        .expect("RFC 3339 formatting of a valid OffsetDateTime cannot fail");
    headers.push((SUBMITTED_AT.to_string(), submitted_at.into_bytes()));
    let backoff_ms = backoff.as_millis() as i64;
    headers.push((BACKOFF.to_string(), backoff_ms.to_be_bytes().to_vec()));
}

/// Decode the retry scheduling headers out of `headers`.
///
/// Returns `Ok(None)` when none of the three headers are present (the record is a
/// first-submission record, not a retry). Returns an error when some but not all are
/// present, or when a present header cannot be parsed.
pub fn decode(headers: &[(String, Vec<u8>)]) -> Result<Option<RetryHeaders>, HeaderDecodeError> {
    let attempt = find(headers, ATTEMPT);
    let submitted_at = find(headers, SUBMITTED_AT);
    let backoff = find(headers, BACKOFF);

    match (attempt, submitted_at, backoff) {
        (None, None, None) => Ok(None),
        (Some(attempt), Some(submitted_at), Some(backoff)) => {
            let attempt = decode_attempt(attempt)?;
            let submitted_at = decode_submitted_at(submitted_at)?;
            let backoff = decode_backoff(backoff)?;
            Ok(Some(RetryHeaders {
                attempt,
                submitted_at,
                backoff,
            }))
        }
        _ => Err(HeaderDecodeError::Partial),
    }
}

fn is_retry_header(name: &str) -> bool {
    name == ATTEMPT || name == SUBMITTED_AT || name == BACKOFF
}

fn find<'a>(headers: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .rev()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_slice())
}

fn decode_attempt(raw: &[u8]) -> Result<u32, HeaderDecodeError> {
    let bytes: [u8; 4] = raw.try_into().map_err(|_| HeaderDecodeError::Attempt)?;
    let attempt = i32::from_be_bytes(bytes);
    u32::try_from(attempt).map_err(|_| HeaderDecodeError::Attempt)
}

fn decode_backoff(raw: &[u8]) -> Result<Duration, HeaderDecodeError> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| HeaderDecodeError::Backoff)?;
    let millis = i64::from_be_bytes(bytes);
    let millis = u64::try_from(millis).map_err(|_| HeaderDecodeError::Backoff)?;
    Ok(Duration::from_millis(millis))
}

fn decode_submitted_at(raw: &[u8]) -> Result<OffsetDateTime, HeaderDecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeaderDecodeError::SubmittedAt)?;
    OffsetDateTime::parse(text, &time::format_description::well_known::Rfc3339)
        .map_err(|_| HeaderDecodeError::SubmittedAt)
}
