pub mod v1;

use chrono::{DateTime, SecondsFormat, Utc};

/// RFC 3339 timestamp with millisecond precision, as stored.
pub(crate) fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
