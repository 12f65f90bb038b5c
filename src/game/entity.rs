//! Authoritative player entity and the input types that drive it

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use super::physics::{Kinematics, MotionParams};

/// Stable per-player identity used across connections, entities and combat
pub type PlayerId = u16;

/// Directional input bitmask as carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputFlags(u32);

impl InputFlags {
    pub const NONE: Self = Self(0);
    pub const FORWARD: Self = Self(0x01);
    pub const BACKWARD: Self = Self(0x02);
    pub const LEFT: Self = Self(0x04);
    pub const RIGHT: Self = Self(0x08);
    pub const UP: Self = Self(0x10);
    pub const DOWN: Self = Self(0x20);

    const ALL_BITS: u32 = 0x3F;

    /// Unknown bits are dropped rather than rejected
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL_BITS)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// -1.0, 0.0 or 1.0 along a pair of opposing flags
    pub fn axis(self, positive: Self, negative: Self) -> f32 {
        let mut value = 0.0;
        if self.contains(positive) {
            value += 1.0;
        }
        if self.contains(negative) {
            value -= 1.0;
        }
        value
    }
}

impl std::ops::BitOr for InputFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Optional absolute pose the client believes it is at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseHint {
    pub position: Vec3,
    pub rotation: Quat,
}

/// One client input, numbered per connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSample {
    pub sequence: u16,
    pub flags: InputFlags,
    /// Signed roll magnitude in [-1, 1]
    pub roll: f32,
    pub speed: f32,
    pub hint: Option<PoseHint>,
}

impl InputSample {
    pub fn new(sequence: u16, flags: InputFlags) -> Self {
        Self {
            sequence,
            flags,
            roll: 0.0,
            speed: 0.0,
            hint: None,
        }
    }
}

/// Wrap-aware "a was issued after b" for u16 sequence numbers
pub fn sequence_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Per-connection gate enforcing strictly increasing input sequences
#[derive(Debug, Clone, Copy, Default)]
pub struct InputSequencer {
    last: Option<u16>,
}

impl InputSequencer {
    /// Returns false (and leaves state untouched) for a non-increasing sequence
    pub fn accept(&mut self, sequence: u16) -> bool {
        match self.last {
            Some(last) if !sequence_newer(sequence, last) => false,
            _ => {
                self.last = Some(sequence);
                true
            }
        }
    }

    /// Last accepted sequence, used as the acknowledgement
    pub fn last(&self) -> Option<u16> {
        self.last
    }
}

/// The replicated part of an entity: exactly what one wire record carries
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: PlayerId,
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub input: InputFlags,
}

/// Authoritative player state (owned by the tick broadcaster)
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: PlayerId,
    pub kinematics: Kinematics,
    pub input: InputFlags,
    pub roll_input: f32,
    pub health: u16,
    /// Server millis of the last accepted shot
    pub last_shot_at: Option<u64>,
    pub shot_cooldown_ms: u64,
}

impl Entity {
    pub fn new(
        id: PlayerId,
        position: Vec3,
        rotation: Quat,
        health: u16,
        shot_cooldown_ms: u64,
        params: &MotionParams,
    ) -> Self {
        Self {
            id,
            kinematics: Kinematics::at(position, rotation, params.cruise_speed),
            input: InputFlags::NONE,
            roll_input: 0.0,
            health,
            last_shot_at: None,
            shot_cooldown_ms,
        }
    }

    pub fn state(&self) -> EntityState {
        EntityState {
            id: self.id,
            position: self.kinematics.position,
            rotation: self.kinematics.rotation,
            velocity: self.kinematics.velocity,
            input: self.input,
        }
    }

    /// Milliseconds until this entity may fire again (0 = ready)
    pub fn cooldown_remaining(&self, now_ms: u64) -> u64 {
        match self.last_shot_at {
            Some(at) => (at + self.shot_cooldown_ms).saturating_sub(now_ms),
            None => 0,
        }
    }
}
