use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch. Transaction creation dates use this
/// resolution so gap ages can be compared against the grace period.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
