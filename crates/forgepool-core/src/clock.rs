use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock-ish monotonic milliseconds, used for `timeLastRelease`,
/// pressure entry ages, and timeout arithmetic (spec §3, §4.4).
///
/// `SystemTime` rather than `Instant` because persisted/logged timestamps
/// benefit from being wall-clock-comparable across process restarts; nothing
/// here depends on monotonicity holding across a clock step.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
