pub mod credential;
pub mod lock;
pub mod relay;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, used for credential validity windows and
/// record timestamps.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
