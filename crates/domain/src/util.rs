use std::time::{SystemTime, UNIX_EPOCH};

use time::{OffsetDateTime, format_description::well_known::Rfc3339, macros::format_description};
use uuid::Uuid;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn uuid_v7_without_dashes() -> String {
    Uuid::now_v7().simple().to_string()
}

fn offset_datetime(epoch_ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn format_ms_rfc3339(epoch_ms: i64) -> String {
    offset_datetime(epoch_ms)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Calendar date (`YYYY-MM-DD`, UTC) for an epoch-millisecond timestamp.
pub fn format_ms_date(epoch_ms: i64) -> String {
    offset_datetime(epoch_ms)
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| "1970-01-01".to_string())
}
