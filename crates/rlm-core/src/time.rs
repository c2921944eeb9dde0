// SPDX-License-Identifier: MIT OR Apache-2.0
//! Timestamp formatting shared by record writers.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp as RFC 3339 with second precision and a `Z` suffix.
#[must_use]
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current UTC time formatted per [`format_timestamp`].
#[must_use]
pub fn utc_now_string() -> String {
    format_timestamp(Utc::now())
}

/// Current UTC time as an epoch second.
#[must_use]
pub fn epoch_now() -> i64 {
    Utc::now().timestamp()
}
