use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the unix epoch.
///
/// Every time-dependent component has a pure `*_at(now)` entry point taking one
/// of these, plus a wrapper that reads the clock. Tests drive the pure form.
pub type Timestamp = f64;

pub fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn as_millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
