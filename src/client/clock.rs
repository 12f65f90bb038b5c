//! Server clock estimation for the client

/// Render remote entities this far behind the estimated server clock
pub const INTERPOLATION_DELAY_MS: u64 = 100;

/// Weight of a new offset observation
const OFFSET_SMOOTHING: f64 = 0.1;

/// Widens the 32-bit wire timestamp back to a monotonic u64
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampUnwrapper {
    last: Option<u64>,
}

impl TimestampUnwrapper {
    pub fn widen(&mut self, wire: u32) -> u64 {
        let value = match self.last {
            None => wire as u64,
            Some(last) => {
                let delta = wire.wrapping_sub(last as u32) as i32 as i64;
                (last as i64 + delta).max(0) as u64
            }
        };
        if self.last.map_or(true, |last| value > last) {
            self.last = Some(value);
        }
        value
    }
}

/// Smoothed offset between the local clock and the server clock
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerClock {
    offset_ms: Option<f64>,
}

impl ServerClock {
    pub fn observe(&mut self, server_ms: u64, local_ms: u64) {
        let sample = server_ms as f64 - local_ms as f64;
        self.offset_ms = Some(match self.offset_ms {
            None => sample,
            Some(offset) => offset + (sample - offset) * OFFSET_SMOOTHING,
        });
    }

    pub fn is_synced(&self) -> bool {
        self.offset_ms.is_some()
    }

    /// Estimated server time at `local_ms`
    pub fn server_now(&self, local_ms: u64) -> u64 {
        let offset = self.offset_ms.unwrap_or(0.0);
        (local_ms as f64 + offset).max(0.0).round() as u64
    }

    /// Server timestamp remote entities are rendered at
    pub fn render_time(&self, local_ms: u64) -> u64 {
        self.server_now(local_ms)
            .saturating_sub(INTERPOLATION_DELAY_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_across_u32_boundary() {
        let mut unwrapper = TimestampUnwrapper::default();
        assert_eq!(unwrapper.widen(u32::MAX - 10), u32::MAX as u64 - 10);
        assert_eq!(unwrapper.widen(5), u32::MAX as u64 + 6);
        // Late packet from before the wrap
        assert_eq!(unwrapper.widen(u32::MAX - 20), u32::MAX as u64 - 20);
        assert_eq!(unwrapper.widen(6), u32::MAX as u64 + 7);
    }

    #[test]
    fn first_observation_sets_offset() {
        let mut clock = ServerClock::default();
        assert!(!clock.is_synced());
        clock.observe(5_000, 1_000);
        assert!(clock.is_synced());
        assert_eq!(clock.server_now(1_500), 5_500);
        assert_eq!(clock.render_time(1_500), 5_400);
    }

    #[test]
    fn offset_is_smoothed() {
        let mut clock = ServerClock::default();
        clock.observe(5_000, 1_000);
        // One late packet moves the estimate only a tenth of the way
        clock.observe(5_000, 2_000);
        assert_eq!(clock.server_now(2_000), 5_900);
    }

    #[test]
    fn render_time_saturates() {
        let clock = ServerClock::default();
        assert_eq!(clock.render_time(40), 0);
    }
}
