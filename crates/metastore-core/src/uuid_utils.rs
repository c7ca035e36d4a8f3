//! UUID v7 utilities for time-ordered identifiers.
//!
//! Replay ids, bus message ids and generated correlation ids are UUIDv7 so
//! they sort by creation time in storage and in logs.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use metastore_core::uuid_utils::new_v7;
///
/// let a = new_v7();
/// let b = new_v7();
/// assert!(b >= a);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Extract the embedded creation time from a UUIDv7.
///
/// Returns `None` for any other UUID version.
pub fn extract_timestamp(id: &Uuid) -> Option<DateTime<Utc>> {
    if id.get_version_num() != 7 {
        return None;
    }
    let bytes = id.as_bytes();
    let millis = bytes[..6]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Utc.timestamp_millis_opt(millis as i64).single()
}
