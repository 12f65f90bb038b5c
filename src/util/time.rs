//! Time utilities for the simulation and connection bookkeeping

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Fixed simulation step for a given tick rate (in seconds)
pub fn tick_delta(tick_rate_hz: u32) -> f32 {
    1.0 / tick_rate_hz.max(1) as f32
}

/// Wall-clock period of one tick
pub fn tick_period(tick_rate_hz: u32) -> Duration {
    Duration::from_micros(1_000_000 / tick_rate_hz.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_period_matches_rate() {
        assert_eq!(tick_period(60), Duration::from_micros(16_666));
        assert_eq!(tick_period(0), Duration::from_secs(1));
        assert!((tick_delta(60) - 1.0 / 60.0).abs() < f32::EPSILON);
    }
}
