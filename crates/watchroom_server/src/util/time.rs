#![forbid(unsafe_code)]

use chrono::{SecondsFormat, Utc};

/// Current UTC time as an RFC 3339 string with millisecond precision,
/// e.g. `2026-01-01T12:00:00.000Z`. Used to stamp every outbound event.
#[inline]
pub fn rfc3339_now() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
