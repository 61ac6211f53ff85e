use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Wall-clock epoch milliseconds. Clocks before the epoch collapse to zero.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
