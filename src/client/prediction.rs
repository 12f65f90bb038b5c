//! Local prediction and reconciliation for the locally controlled entity
//!
//! Each local input is integrated immediately with the server's motion model
//! and kept until the server acknowledges it. On fresh authoritative state the
//! entity snaps to server truth and the unacknowledged inputs are replayed.

use std::collections::VecDeque;

use tracing::debug;

use crate::game::entity::{sequence_newer, EntityState, InputFlags, InputSample, PlayerId, PoseHint};
use crate::game::physics::{self, Kinematics, MotionParams};
use crate::util::time::tick_delta;

/// Unacknowledged inputs kept before the oldest is discarded
const MAX_PENDING: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionPhase {
    /// No unacknowledged input
    Idle,
    /// Inputs applied locally, waiting for the server
    Predicting,
    /// Acknowledgement received, waiting for the matching authoritative state
    Reconciling,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// Inputs replayed on top of the authoritative state
    pub replayed: usize,
    /// Distance between the predicted pose before and after reconciling
    pub correction: f32,
}

pub struct Predictor {
    identity: PlayerId,
    params: MotionParams,
    step_dt: f32,
    kinematics: Option<Kinematics>,
    input: InputFlags,
    pending: VecDeque<InputSample>,
    next_sequence: u16,
    last_ack: Option<u16>,
    phase: PredictionPhase,
}

impl Predictor {
    pub fn new(identity: PlayerId, params: MotionParams, tick_rate_hz: u32) -> Self {
        Self {
            identity,
            params,
            step_dt: tick_delta(tick_rate_hz),
            kinematics: None,
            input: InputFlags::NONE,
            pending: VecDeque::new(),
            next_sequence: 1,
            last_ack: None,
            phase: PredictionPhase::Idle,
        }
    }

    pub fn identity(&self) -> PlayerId {
        self.identity
    }

    pub fn phase(&self) -> PredictionPhase {
        self.phase
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_sequences(&self) -> impl Iterator<Item = u16> + '_ {
        self.pending.iter().map(|s| s.sequence)
    }

    pub fn last_ack(&self) -> Option<u16> {
        self.last_ack
    }

    /// Currently held input flags
    pub fn input(&self) -> InputFlags {
        self.input
    }

    pub fn speed(&self) -> f32 {
        self.kinematics.map(|k| k.speed).unwrap_or(0.0)
    }

    /// Predicted state, once authoritative state has been seen
    pub fn state(&self) -> Option<EntityState> {
        self.kinematics.map(|k| EntityState {
            id: self.identity,
            position: k.position,
            rotation: k.rotation,
            velocity: k.velocity,
            input: self.input,
        })
    }

    /// Number a new local input, predict it and return the sample to send.
    /// With `hint`, the sample carries the pose the input was issued from.
    pub fn next_input(&mut self, flags: InputFlags, roll: f32, hint: bool) -> InputSample {
        let mut sample = InputSample::new(self.next_sequence, flags);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sample.roll = roll.clamp(-1.0, 1.0);
        if let Some(k) = &self.kinematics {
            sample.speed = k.speed;
            if hint {
                sample.hint = Some(PoseHint {
                    position: k.position,
                    rotation: k.rotation,
                });
            }
        }
        self.apply_local(sample);
        sample
    }

    /// Predict an already numbered sample. Non-increasing sequences are ignored.
    pub fn apply_local(&mut self, sample: InputSample) -> bool {
        if let Some(newest) = self.pending.back() {
            if !sequence_newer(sample.sequence, newest.sequence) {
                return false;
            }
        }
        if let Some(ack) = self.last_ack {
            if !sequence_newer(sample.sequence, ack) {
                return false;
            }
        }

        self.input = sample.flags;
        if let Some(k) = &mut self.kinematics {
            physics::integrate(k, sample.flags, sample.roll, self.step_dt, &self.params);
        }

        self.pending.push_back(sample);
        if self.pending.len() > MAX_PENDING {
            self.pending.pop_front();
        }
        self.next_sequence = sample.sequence.wrapping_add(1);
        self.phase = PredictionPhase::Predicting;
        true
    }

    /// Server applied every input up to `sequence`; drop them.
    /// Returns the number of inputs discarded.
    pub fn acknowledge(&mut self, sequence: u16) -> usize {
        if let Some(last) = self.last_ack {
            if !sequence_newer(sequence, last) {
                return 0;
            }
        }
        self.last_ack = Some(sequence);

        let before = self.pending.len();
        self.pending
            .retain(|sample| sequence_newer(sample.sequence, sequence));
        self.phase = PredictionPhase::Reconciling;
        before - self.pending.len()
    }

    /// Snap to authoritative state and replay what the server has not seen yet
    pub fn reconcile(&mut self, authoritative: &EntityState) -> Reconciliation {
        let predicted = self.kinematics.map(|k| k.position);

        let mut k = self.kinematics.unwrap_or_else(|| {
            Kinematics::at(authoritative.position, authoritative.rotation, 0.0)
        });
        k.reset_to(
            authoritative.position,
            authoritative.rotation,
            authoritative.velocity,
        );
        for sample in &self.pending {
            physics::integrate(&mut k, sample.flags, sample.roll, self.step_dt, &self.params);
        }
        self.kinematics = Some(k);
        if self.pending.is_empty() {
            self.input = authoritative.input;
        }

        let correction = predicted
            .map(|p| p.distance(k.position))
            .unwrap_or(0.0);
        if correction > self.params.hint_tolerance {
            debug!(
                player_id = self.identity,
                correction,
                pending = self.pending.len(),
                "Large prediction correction"
            );
        }

        self.phase = if self.pending.is_empty() {
            PredictionPhase::Idle
        } else {
            PredictionPhase::Predicting
        };

        Reconciliation {
            replayed: self.pending.len(),
            correction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use glam::{Quat, Vec3};

    fn authoritative(position: Vec3) -> EntityState {
        EntityState {
            id: 7,
            position,
            rotation: Quat::IDENTITY,
            velocity: Vec3::new(0.0, 0.0, -60.0),
            input: InputFlags::NONE,
        }
    }

    fn predictor() -> Predictor {
        let mut p = Predictor::new(7, MotionParams::default(), 60);
        p.reconcile(&authoritative(Vec3::new(0.0, 100.0, 0.0)));
        p
    }

    #[test]
    fn input_moves_local_entity_immediately() {
        let mut p = predictor();
        let sample = p.next_input(InputFlags::FORWARD, 0.0, false);

        assert_eq!(sample.sequence, 1);
        assert_eq!(p.phase(), PredictionPhase::Predicting);
        let z = p.state().unwrap().position.z;
        assert!(z < 0.0);
    }

    #[test]
    fn acknowledged_inputs_are_dropped() {
        let mut p = predictor();
        for _ in 0..3 {
            p.next_input(InputFlags::FORWARD, 0.0, false);
        }

        assert_eq!(p.acknowledge(2), 2);
        assert_eq!(p.pending_sequences().collect::<Vec<_>>(), vec![3]);
        assert_eq!(p.phase(), PredictionPhase::Reconciling);

        // A stale ack changes nothing
        assert_eq!(p.acknowledge(1), 0);
        assert_eq!(p.pending_len(), 1);
    }

    #[test]
    fn reconcile_replays_pending_on_authority() {
        let mut p = predictor();
        for _ in 0..3 {
            p.next_input(InputFlags::NONE, 0.0, false);
        }
        p.acknowledge(1);

        // Server says we were 2 units to the right after input 1
        let server = authoritative(Vec3::new(2.0, 100.0, -1.0));
        let result = p.reconcile(&server);

        let mut expected = Kinematics::at(server.position, server.rotation, 0.0);
        expected.reset_to(server.position, server.rotation, server.velocity);
        let params = MotionParams::default();
        for _ in 0..2 {
            physics::integrate(&mut expected, InputFlags::NONE, 0.0, 1.0 / 60.0, &params);
        }

        let state = p.state().unwrap();
        assert_eq!(result.replayed, 2);
        assert_approx_eq!(state.position.x, expected.position.x, 1e-4);
        assert_approx_eq!(state.position.z, expected.position.z, 1e-4);
        assert!(result.correction > 1.9);
        assert_eq!(p.phase(), PredictionPhase::Predicting);
    }

    #[test]
    fn full_ack_returns_to_idle() {
        let mut p = predictor();
        for _ in 0..3 {
            p.next_input(InputFlags::LEFT, 0.0, false);
        }
        p.acknowledge(3);
        let result = p.reconcile(&authoritative(Vec3::new(0.0, 100.0, -3.0)));

        assert_eq!(result.replayed, 0);
        assert_eq!(p.pending_len(), 0);
        assert_eq!(p.phase(), PredictionPhase::Idle);
        assert_eq!(p.state().unwrap().position, Vec3::new(0.0, 100.0, -3.0));
    }

    #[test]
    fn out_of_order_local_sample_is_ignored() {
        let mut p = predictor();
        assert!(p.apply_local(InputSample::new(5, InputFlags::FORWARD)));
        assert!(!p.apply_local(InputSample::new(3, InputFlags::LEFT)));
        assert_eq!(p.input(), InputFlags::FORWARD);
        assert_eq!(p.next_input(InputFlags::NONE, 0.0, false).sequence, 6);
    }

    #[test]
    fn hint_carries_pre_input_pose() {
        let mut p = predictor();
        let before = p.state().unwrap().position;
        let sample = p.next_input(InputFlags::UP, 0.3, true);
        assert_eq!(sample.hint.unwrap().position, before);
        assert_approx_eq!(sample.roll, 0.3, 1e-6);
    }

    #[test]
    fn sequences_wrap() {
        let mut p = predictor();
        assert!(p.apply_local(InputSample::new(u16::MAX, InputFlags::NONE)));
        let next = p.next_input(InputFlags::NONE, 0.0, false);
        assert_eq!(next.sequence, 0);
        assert_eq!(p.acknowledge(u16::MAX), 1);
        assert_eq!(p.pending_sequences().collect::<Vec<_>>(), vec![0]);
    }
}
