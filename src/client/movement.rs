//! Movement events: coarse intent, sent alongside the binary input stream

use crate::game::entity::{EntityState, InputFlags};
use crate::ws::protocol::MovementEvent;

/// Re-send the current intent at least this often
pub const HEARTBEAT_MS: u64 = 1000;

#[derive(Debug)]
pub struct MovementReporter {
    last_flags: Option<InputFlags>,
    last_sent_ms: u64,
    heartbeat_ms: u64,
}

impl Default for MovementReporter {
    fn default() -> Self {
        Self::new(HEARTBEAT_MS)
    }
}

impl MovementReporter {
    pub fn new(heartbeat_ms: u64) -> Self {
        Self {
            last_flags: None,
            last_sent_ms: 0,
            heartbeat_ms,
        }
    }

    /// Emit an event when the input bitmask changed or the heartbeat is due
    pub fn update(
        &mut self,
        now_ms: u64,
        flags: InputFlags,
        state: &EntityState,
        speed: f32,
    ) -> Option<MovementEvent> {
        let changed = self.last_flags != Some(flags);
        let due = now_ms.saturating_sub(self.last_sent_ms) >= self.heartbeat_ms;
        if !changed && !due {
            return None;
        }

        self.last_flags = Some(flags);
        self.last_sent_ms = now_ms;
        Some(MovementEvent {
            input: flags,
            position: state.position,
            rotation: state.rotation,
            speed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn state() -> EntityState {
        EntityState {
            id: 7,
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            input: InputFlags::NONE,
        }
    }

    #[test]
    fn emits_on_change_and_heartbeat() {
        let mut reporter = MovementReporter::new(1000);
        let s = state();

        let first = reporter.update(0, InputFlags::FORWARD, &s, 60.0).unwrap();
        assert_eq!(first.input, InputFlags::FORWARD);
        assert_eq!(first.position, s.position);

        assert!(reporter.update(500, InputFlags::FORWARD, &s, 60.0).is_none());

        let turned = InputFlags::FORWARD | InputFlags::LEFT;
        assert!(reporter.update(600, turned, &s, 60.0).is_some());
        assert!(reporter.update(1500, turned, &s, 60.0).is_none());
        assert!(reporter.update(1600, turned, &s, 60.0).is_some());
    }
}
