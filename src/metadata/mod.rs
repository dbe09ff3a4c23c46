//! Metadata storage layer.
//!
//! The metadata store keeps track of users, credentials, buckets, objects,
//! and multipart uploads.  The [`store::MetadataStore`] trait defines the
//! interface; [`sqlite::SqliteMetadataStore`] is the default implementation.

pub mod sqlite;
pub mod store;

use chrono::{Duration, SecondsFormat, Utc};

/// Current time as an ISO-8601 string with millisecond precision.
///
/// All stored timestamps use this fixed-width form so they sort and
/// compare correctly as text.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The timestamp `seconds` before now, in the same form as [`timestamp_now`].
pub fn timestamp_before(seconds: u64) -> String {
    // Clamped to a century; chrono panics on out-of-range durations.
    let delta = Duration::seconds(seconds.min(100 * 365 * 24 * 3600) as i64);
    (Utc::now() - delta).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Fresh opaque version identifier.
pub fn new_version_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
