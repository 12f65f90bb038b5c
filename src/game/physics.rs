//! Flight motion model shared by the server tick and client prediction

use glam::{EulerRot, Quat, Vec3};

use super::entity::{InputFlags, PoseHint};

/// Motion tuning values. None of these are protocol invariants; they are
/// loaded from configuration and must match between server and client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionParams {
    /// Yaw change in radians per second while left/right is held
    pub turn_rate: f32,
    /// Pitch change in radians per second while up/down is held
    pub pitch_rate: f32,
    /// Pitch limit in radians
    pub max_pitch: f32,
    /// Bank angle in radians at full roll magnitude
    pub max_bank: f32,
    /// Exponential smoothing rate toward the target attitude (1/s)
    pub rotation_smoothing: f32,
    /// Speed change per second while forward/backward is held
    pub acceleration: f32,
    /// Speed the aircraft settles at with no throttle input
    pub cruise_speed: f32,
    pub min_speed: f32,
    pub max_speed: f32,
    /// Lowest allowed altitude (y)
    pub min_altitude: f32,
    /// Maximum distance at which a client pose hint is adopted
    pub hint_tolerance: f32,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            turn_rate: 1.6,
            pitch_rate: 1.2,
            max_pitch: 1.2,
            max_bank: 0.9,
            rotation_smoothing: 6.0,
            acceleration: 40.0,
            cruise_speed: 60.0,
            min_speed: 20.0,
            max_speed: 140.0,
            min_altitude: 5.0,
            hint_tolerance: 25.0,
        }
    }
}

/// Position, attitude and speed of one aircraft
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kinematics {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub speed: f32,
    /// Target attitude the rotation is smoothed toward
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

impl Kinematics {
    pub fn at(position: Vec3, rotation: Quat, speed: f32) -> Self {
        let (yaw, pitch, roll) = rotation.to_euler(EulerRot::YXZ);
        Self {
            position,
            rotation,
            velocity: forward(rotation) * speed,
            speed,
            yaw,
            pitch,
            roll,
        }
    }

    /// Snap to an authoritative pose, keeping speed derived from velocity
    pub fn reset_to(&mut self, position: Vec3, rotation: Quat, velocity: Vec3) {
        let (yaw, pitch, roll) = rotation.to_euler(EulerRot::YXZ);
        self.position = position;
        self.rotation = rotation;
        self.velocity = velocity;
        self.speed = velocity.length();
        self.yaw = yaw;
        self.pitch = pitch;
        self.roll = roll;
    }
}

/// Local forward axis (-Z) of a rotation
pub fn forward(rotation: Quat) -> Vec3 {
    rotation * Vec3::NEG_Z
}

/// Advance one step: smooth the attitude toward the target Euler angles,
/// then translate along the forward axis and clamp altitude.
pub fn integrate(
    kinematics: &mut Kinematics,
    input: InputFlags,
    roll_input: f32,
    dt: f32,
    params: &MotionParams,
) {
    let turn = input.axis(InputFlags::LEFT, InputFlags::RIGHT);
    let climb = input.axis(InputFlags::UP, InputFlags::DOWN);
    let throttle = input.axis(InputFlags::FORWARD, InputFlags::BACKWARD);

    kinematics.yaw = wrap_angle(kinematics.yaw + turn * params.turn_rate * dt);
    kinematics.pitch = (kinematics.pitch + climb * params.pitch_rate * dt)
        .clamp(-params.max_pitch, params.max_pitch);
    kinematics.roll = roll_input.clamp(-1.0, 1.0) * params.max_bank;

    let target = Quat::from_euler(EulerRot::YXZ, kinematics.yaw, kinematics.pitch, kinematics.roll);
    let alpha = 1.0 - (-params.rotation_smoothing * dt).exp();
    kinematics.rotation = kinematics.rotation.slerp(target, alpha).normalize();

    if throttle != 0.0 {
        kinematics.speed += throttle * params.acceleration * dt;
    } else {
        // Drift back toward cruise
        let delta = params.cruise_speed - kinematics.speed;
        let step = params.acceleration * 0.5 * dt;
        kinematics.speed += delta.clamp(-step, step);
    }
    kinematics.speed = kinematics.speed.clamp(params.min_speed, params.max_speed);

    kinematics.velocity = forward(kinematics.rotation) * kinematics.speed;
    kinematics.position += kinematics.velocity * dt;
    if kinematics.position.y < params.min_altitude {
        kinematics.position.y = params.min_altitude;
    }
}

/// Adopt a client pose hint if it is close enough to authoritative state.
/// Returns whether the hint was applied.
pub fn apply_hint(
    kinematics: &mut Kinematics,
    hint: &PoseHint,
    reported_speed: f32,
    params: &MotionParams,
) -> bool {
    if !hint.position.is_finite() || !hint.rotation.is_finite() {
        return false;
    }
    if hint.position.distance(kinematics.position) > params.hint_tolerance {
        return false;
    }

    let rotation = hint.rotation.normalize();
    let speed = if reported_speed.is_finite() && reported_speed > 0.0 {
        reported_speed.clamp(params.min_speed, params.max_speed)
    } else {
        kinematics.speed
    };

    let (yaw, pitch, _) = rotation.to_euler(EulerRot::YXZ);
    kinematics.position = hint.position;
    kinematics.position.y = kinematics.position.y.max(params.min_altitude);
    kinematics.rotation = rotation;
    kinematics.yaw = yaw;
    kinematics.pitch = pitch.clamp(-params.max_pitch, params.max_pitch);
    kinematics.speed = speed;
    kinematics.velocity = forward(rotation) * speed;
    true
}

fn wrap_angle(angle: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    (angle + PI).rem_euclid(TAU) - PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const DT: f32 = 1.0 / 60.0;

    fn level_flight(params: &MotionParams) -> Kinematics {
        Kinematics::at(Vec3::new(0.0, 100.0, 0.0), Quat::IDENTITY, params.cruise_speed)
    }

    #[test]
    fn idle_flight_moves_along_negative_z() {
        let params = MotionParams::default();
        let mut k = level_flight(&params);
        integrate(&mut k, InputFlags::NONE, 0.0, DT, &params);

        assert_approx_eq!(k.position.x, 0.0, 1e-4);
        assert_approx_eq!(k.position.y, 100.0, 1e-4);
        assert_approx_eq!(k.position.z, -params.cruise_speed * DT, 1e-4);
    }

    #[test]
    fn forward_accelerates_up_to_max_speed() {
        let params = MotionParams::default();
        let mut k = level_flight(&params);
        for _ in 0..600 {
            integrate(&mut k, InputFlags::FORWARD, 0.0, DT, &params);
        }
        assert_approx_eq!(k.speed, params.max_speed, 1e-3);
    }

    #[test]
    fn left_turns_toward_negative_x() {
        let params = MotionParams::default();
        let mut k = level_flight(&params);
        for _ in 0..60 {
            integrate(&mut k, InputFlags::LEFT, 0.0, DT, &params);
        }
        assert!(k.position.x < 0.0);
        assert!(k.yaw > 0.0);
    }

    #[test]
    fn altitude_is_clamped() {
        let params = MotionParams::default();
        let mut k = Kinematics::at(
            Vec3::new(0.0, params.min_altitude, 0.0),
            Quat::from_rotation_x(-0.8),
            params.cruise_speed,
        );
        for _ in 0..120 {
            integrate(&mut k, InputFlags::DOWN, 0.0, DT, &params);
            assert!(k.position.y >= params.min_altitude);
        }
    }

    #[test]
    fn pitch_is_limited() {
        let params = MotionParams::default();
        let mut k = level_flight(&params);
        for _ in 0..600 {
            integrate(&mut k, InputFlags::UP, 0.0, DT, &params);
        }
        assert_approx_eq!(k.pitch, params.max_pitch, 1e-5);
    }

    #[test]
    fn integration_is_deterministic() {
        let params = MotionParams::default();
        let inputs = [
            InputFlags::FORWARD,
            InputFlags::FORWARD | InputFlags::LEFT,
            InputFlags::UP,
            InputFlags::NONE,
        ];
        let mut a = level_flight(&params);
        let mut b = level_flight(&params);
        for flags in inputs {
            integrate(&mut a, flags, 0.3, DT, &params);
            integrate(&mut b, flags, 0.3, DT, &params);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn distant_hint_is_ignored() {
        let params = MotionParams::default();
        let mut k = level_flight(&params);
        let hint = PoseHint {
            position: Vec3::new(500.0, 100.0, 0.0),
            rotation: Quat::IDENTITY,
        };
        assert!(!apply_hint(&mut k, &hint, 80.0, &params));
        assert_eq!(k.position, Vec3::new(0.0, 100.0, 0.0));
    }

    #[test]
    fn nearby_hint_is_adopted() {
        let params = MotionParams::default();
        let mut k = level_flight(&params);
        let hint = PoseHint {
            position: Vec3::new(3.0, 101.0, -2.0),
            rotation: Quat::from_rotation_y(0.5),
        };
        assert!(apply_hint(&mut k, &hint, 80.0, &params));
        assert_eq!(k.position, hint.position);
        assert_approx_eq!(k.speed, 80.0, 1e-6);
        assert_approx_eq!(k.yaw, 0.5, 1e-5);
    }
}
