//! Authoritative entity table

use std::collections::HashMap;

use glam::Vec3;
use rand::Rng;
use tracing::debug;

use super::combat::{CombatRules, CombatValidator, HitIntent, HitOutcome, HitRejection};
use super::entity::{Entity, EntityState, InputSample, PlayerId};
use super::physics::{self, MotionParams};

/// Horizontal spread of initial spawn points around the respawn point
const SPAWN_SPREAD: f32 = 150.0;

/// All authoritative entities plus the rules that mutate them.
///
/// Owned by exactly one task (the tick broadcaster); every mutation goes
/// through `&mut self`.
pub struct World {
    entities: HashMap<PlayerId, Entity>,
    combat: CombatValidator,
    motion: MotionParams,
}

impl World {
    pub fn new(motion: MotionParams, rules: CombatRules) -> Self {
        Self {
            entities: HashMap::new(),
            combat: CombatValidator::new(rules),
            motion,
        }
    }

    pub fn motion(&self) -> &MotionParams {
        &self.motion
    }

    pub fn rules(&self) -> &CombatRules {
        self.combat.rules()
    }

    /// Spawn an entity for `id`, or return the existing one on reconnect
    pub fn spawn(&mut self, id: PlayerId) -> EntityState {
        if let Some(existing) = self.entities.get(&id) {
            return existing.state();
        }

        let rules = *self.combat.rules();
        let mut rng = rand::thread_rng();
        let offset = Vec3::new(
            rng.gen_range(-SPAWN_SPREAD..SPAWN_SPREAD),
            0.0,
            rng.gen_range(-SPAWN_SPREAD..SPAWN_SPREAD),
        );
        let entity = Entity::new(
            id,
            rules.respawn_position + offset,
            rules.respawn_rotation,
            rules.max_health,
            rules.shot_cooldown_ms,
            &self.motion,
        );
        let state = entity.state();
        self.entities.insert(id, entity);
        state
    }

    pub fn remove(&mut self, id: PlayerId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    pub fn get(&self, id: PlayerId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Store the held input of an already sequenced sample
    pub fn apply_input(&mut self, id: PlayerId, sample: &InputSample) -> bool {
        let motion = self.motion;
        let Some(entity) = self.entities.get_mut(&id) else {
            return false;
        };

        entity.input = sample.flags;
        entity.roll_input = if sample.roll.is_finite() {
            sample.roll.clamp(-1.0, 1.0)
        } else {
            0.0
        };

        if let Some(hint) = &sample.hint {
            if !physics::apply_hint(&mut entity.kinematics, hint, sample.speed, &motion) {
                debug!(player_id = id, seq = sample.sequence, "Ignoring out-of-tolerance pose hint");
            }
        }
        true
    }

    /// Integrate every entity by one step. Entities are independent.
    pub fn step(&mut self, dt: f32) {
        for entity in self.entities.values_mut() {
            physics::integrate(
                &mut entity.kinematics,
                entity.input,
                entity.roll_input,
                dt,
                &self.motion,
            );
        }
    }

    pub fn apply_hit(&mut self, intent: &HitIntent, now_ms: u64) -> Result<HitOutcome, HitRejection> {
        self.combat.apply_hit(&mut self.entities, intent, now_ms)
    }

    pub fn apply_kill(
        &mut self,
        attacker: PlayerId,
        victim: PlayerId,
        now_ms: u64,
    ) -> Result<HitOutcome, HitRejection> {
        self.combat.apply_kill(&mut self.entities, attacker, victim, now_ms)
    }

    /// Replicated state of every entity, ordered by identity
    pub fn states(&self) -> Vec<EntityState> {
        let mut states: Vec<EntityState> = self.entities.values().map(Entity::state).collect();
        states.sort_by_key(|s| s.id);
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{InputFlags, InputSequencer, PoseHint};

    fn world() -> World {
        World::new(MotionParams::default(), CombatRules::default())
    }

    #[test]
    fn spawn_is_idempotent_per_identity() {
        let mut world = world();
        let first = world.spawn(3);
        let second = world.spawn(3);
        assert_eq!(first, second);
        assert_eq!(world.len(), 1);
        assert_eq!(world.get(3).unwrap().health, 100);
    }

    #[test]
    fn stale_sequence_leaves_newer_input_in_place() {
        let mut world = world();
        world.spawn(1);
        let mut gate = InputSequencer::default();

        let newer = InputSample::new(5, InputFlags::FORWARD);
        let stale = InputSample::new(3, InputFlags::BACKWARD | InputFlags::LEFT);

        for sample in [newer, stale] {
            if gate.accept(sample.sequence) {
                world.apply_input(1, &sample);
            }
        }

        assert_eq!(world.get(1).unwrap().input, InputFlags::FORWARD);
        assert_eq!(gate.last(), Some(5));
    }

    #[test]
    fn input_for_unknown_entity_is_ignored() {
        let mut world = world();
        assert!(!world.apply_input(9, &InputSample::new(1, InputFlags::UP)));
    }

    #[test]
    fn roll_is_clamped() {
        let mut world = world();
        world.spawn(1);
        let mut sample = InputSample::new(1, InputFlags::NONE);
        sample.roll = 7.0;
        world.apply_input(1, &sample);
        assert_eq!(world.get(1).unwrap().roll_input, 1.0);

        sample.roll = f32::NAN;
        world.apply_input(1, &sample);
        assert_eq!(world.get(1).unwrap().roll_input, 0.0);
    }

    #[test]
    fn hint_within_tolerance_moves_entity() {
        let mut world = world();
        let spawned = world.spawn(1);
        let target = spawned.position + Vec3::new(2.0, 0.0, 0.0);
        let mut sample = InputSample::new(1, InputFlags::NONE);
        sample.hint = Some(PoseHint {
            position: target,
            rotation: spawned.rotation,
        });
        world.apply_input(1, &sample);
        assert_eq!(world.get(1).unwrap().kinematics.position, target);
    }

    #[test]
    fn step_moves_every_entity() {
        let mut world = world();
        let a = world.spawn(1);
        let b = world.spawn(2);
        world.step(1.0 / 60.0);
        let states = world.states();
        assert_eq!(states[0].id, 1);
        assert_ne!(states[0].position, a.position);
        assert_ne!(states[1].position, b.position);
    }

    #[test]
    fn removed_entity_cannot_be_hit() {
        let mut world = world();
        world.spawn(1);
        world.spawn(2);
        world.remove(2);
        let intent = HitIntent {
            attacker: 1,
            victim: 2,
            damage: 10,
            point: Vec3::ZERO,
            distance: 5.0,
        };
        assert_eq!(world.apply_hit(&intent, 0), Err(HitRejection::UnknownVictim));
    }
}
