use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// `None` when `ms` is outside the range chrono can represent
pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// `from + duration`, or `None` when the result is not representable
pub fn checked_expiry(from: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    let duration = chrono::Duration::from_std(duration).ok()?;
    from.checked_add_signed(duration)
}

pub fn format_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Whole seconds until `ms` milliseconds have elapsed, rounded up.
pub fn ceil_secs(ms: i64) -> u64 {
    if ms <= 0 {
        0
    } else {
        ((ms + 999) / 1000) as u64
    }
}
