use std::sync::OnceLock;
use std::time::Instant;

/// CPU timestamp in nanoseconds on a monotonic clock.
///
/// Only differences and ordering matter; the epoch is the first call.
pub fn now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
