//! Wall-clock and file timestamp helpers (epoch seconds as `f64`).

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;

pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Modification time of `path`, or `None` if it cannot be read.
pub fn mtime(path: &Path) -> Option<f64> {
    let metadata = fs::metadata(path).ok()?;
    metadata.modified().ok().map(epoch_seconds)
}

/// Nanoseconds since the epoch, for hashes that must never repeat.
pub fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
