//! Combat validation - shot cooldown, damage and the death/respawn transition

use std::collections::HashMap;

use glam::{Quat, Vec3};
use serde::Serialize;

use super::entity::{Entity, PlayerId};

/// Damage of a direct kill intent
pub const KILL_DAMAGE: u32 = 100;

/// Combat tuning shared by every entity
#[derive(Debug, Clone, Copy)]
pub struct CombatRules {
    pub max_health: u16,
    /// Minimum time between accepted shots of one attacker
    pub shot_cooldown_ms: u64,
    pub respawn_position: Vec3,
    pub respawn_rotation: Quat,
}

impl Default for CombatRules {
    fn default() -> Self {
        Self {
            max_health: 100,
            shot_cooldown_ms: 500,
            respawn_position: Vec3::new(0.0, 120.0, 0.0),
            respawn_rotation: Quat::IDENTITY,
        }
    }
}

/// A hit claimed by an attacker
#[derive(Debug, Clone, Copy)]
pub struct HitIntent {
    pub attacker: PlayerId,
    pub victim: PlayerId,
    pub damage: u32,
    /// World-space point of impact
    pub point: Vec3,
    pub distance: f32,
}

/// Why a hit had no effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HitRejection {
    #[error("attacker cannot hit itself")]
    SelfHit,

    #[error("unknown attacker")]
    UnknownAttacker,

    #[error("unknown victim")]
    UnknownVictim,

    #[error("shot cooldown active ({remaining_ms} ms remaining)")]
    Cooldown { remaining_ms: u64 },
}

/// Derived when a victim's health transitions to zero
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeathEvent {
    pub victim: PlayerId,
    pub attacker: PlayerId,
    pub respawn_position: Vec3,
    pub at_ms: u64,
}

/// Result of an accepted hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitOutcome {
    /// Victim health right after damage (0 on a kill, before respawn)
    pub victim_health: u16,
    pub death: Option<DeathEvent>,
}

/// The single authoritative point of health mutation
#[derive(Debug, Clone)]
pub struct CombatValidator {
    rules: CombatRules,
}

impl CombatValidator {
    pub fn new(rules: CombatRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &CombatRules {
        &self.rules
    }

    /// Validate and apply a hit. Attacker and victim are read and mutated
    /// under the same `&mut` borrow of the entity table, so two
    /// simultaneous hits can never interleave.
    pub fn apply_hit(
        &self,
        entities: &mut HashMap<PlayerId, Entity>,
        intent: &HitIntent,
        now_ms: u64,
    ) -> Result<HitOutcome, HitRejection> {
        if intent.attacker == intent.victim {
            return Err(HitRejection::SelfHit);
        }

        let attacker = entities
            .get(&intent.attacker)
            .ok_or(HitRejection::UnknownAttacker)?;
        let remaining_ms = attacker.cooldown_remaining(now_ms);
        if remaining_ms > 0 {
            return Err(HitRejection::Cooldown { remaining_ms });
        }
        if !entities.contains_key(&intent.victim) {
            return Err(HitRejection::UnknownVictim);
        }

        if let Some(attacker) = entities.get_mut(&intent.attacker) {
            attacker.last_shot_at = Some(now_ms);
        }

        let victim = entities
            .get_mut(&intent.victim)
            .ok_or(HitRejection::UnknownVictim)?;
        let damage = intent.damage.min(u16::MAX as u32) as u16;
        victim.health = victim.health.saturating_sub(damage);
        let victim_health = victim.health;

        let death = if victim_health == 0 {
            self.respawn(victim);
            Some(DeathEvent {
                victim: intent.victim,
                attacker: intent.attacker,
                respawn_position: self.rules.respawn_position,
                at_ms: now_ms,
            })
        } else {
            None
        };

        Ok(HitOutcome {
            victim_health,
            death,
        })
    }

    /// Direct full-damage hit
    pub fn apply_kill(
        &self,
        entities: &mut HashMap<PlayerId, Entity>,
        attacker: PlayerId,
        victim: PlayerId,
        now_ms: u64,
    ) -> Result<HitOutcome, HitRejection> {
        let point = entities
            .get(&victim)
            .map(|v| v.kinematics.position)
            .unwrap_or(Vec3::ZERO);
        let intent = HitIntent {
            attacker,
            victim,
            damage: KILL_DAMAGE,
            point,
            distance: 0.0,
        };
        self.apply_hit(entities, &intent, now_ms)
    }

    /// Death state: restore health and move to the fixed respawn point
    fn respawn(&self, victim: &mut Entity) {
        let speed = victim.kinematics.speed;
        victim.health = self.rules.max_health;
        victim.kinematics.reset_to(
            self.rules.respawn_position,
            self.rules.respawn_rotation,
            super::physics::forward(self.rules.respawn_rotation) * speed,
        );
        victim.input = Default::default();
        victim.roll_input = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::MotionParams;

    fn table(healths: &[(PlayerId, u16)]) -> HashMap<PlayerId, Entity> {
        let params = MotionParams::default();
        healths
            .iter()
            .map(|&(id, health)| {
                let pos = Vec3::new(id as f32 * 50.0, 80.0, 0.0);
                (id, Entity::new(id, pos, Quat::IDENTITY, health, 500, &params))
            })
            .collect()
    }

    fn hit(attacker: PlayerId, victim: PlayerId, damage: u32) -> HitIntent {
        HitIntent {
            attacker,
            victim,
            damage,
            point: Vec3::ZERO,
            distance: 10.0,
        }
    }

    #[test]
    fn cooldown_rejects_second_shot() {
        let validator = CombatValidator::new(CombatRules::default());
        let mut entities = table(&[(1, 100), (2, 100)]);

        let first = validator.apply_hit(&mut entities, &hit(1, 2, 10), 1_000);
        let second = validator.apply_hit(&mut entities, &hit(1, 2, 10), 1_100);

        assert_eq!(first.unwrap().victim_health, 90);
        assert_eq!(second, Err(HitRejection::Cooldown { remaining_ms: 400 }));
        assert_eq!(entities[&2].health, 90);
        assert_eq!(entities[&1].last_shot_at, Some(1_000));
    }

    #[test]
    fn shot_at_exact_cooldown_boundary_is_accepted() {
        let validator = CombatValidator::new(CombatRules::default());
        let mut entities = table(&[(1, 100), (2, 100)]);

        validator.apply_hit(&mut entities, &hit(1, 2, 10), 1_000).unwrap();
        let outcome = validator.apply_hit(&mut entities, &hit(1, 2, 10), 1_500);
        assert_eq!(outcome.unwrap().victim_health, 80);
    }

    #[test]
    fn self_hit_is_rejected_without_mutation() {
        let validator = CombatValidator::new(CombatRules::default());
        let mut entities = table(&[(1, 100)]);

        assert_eq!(
            validator.apply_hit(&mut entities, &hit(1, 1, 10), 1_000),
            Err(HitRejection::SelfHit)
        );
        assert_eq!(entities[&1].health, 100);
        assert_eq!(entities[&1].last_shot_at, None);
    }

    #[test]
    fn unknown_victim_does_not_consume_cooldown() {
        let validator = CombatValidator::new(CombatRules::default());
        let mut entities = table(&[(1, 100)]);

        assert_eq!(
            validator.apply_hit(&mut entities, &hit(1, 9, 10), 1_000),
            Err(HitRejection::UnknownVictim)
        );
        assert_eq!(entities[&1].last_shot_at, None);
    }

    #[test]
    fn lethal_hit_respawns_victim() {
        let rules = CombatRules::default();
        let validator = CombatValidator::new(rules);
        let mut entities = table(&[(1, 100), (2, 10)]);

        let outcome = validator
            .apply_hit(&mut entities, &hit(1, 2, 20), 5_000)
            .unwrap();

        assert_eq!(outcome.victim_health, 0);
        let death = outcome.death.expect("death event");
        assert_eq!(death.victim, 2);
        assert_eq!(death.attacker, 1);
        assert_eq!(death.respawn_position, rules.respawn_position);

        let victim = &entities[&2];
        assert_eq!(victim.health, rules.max_health);
        assert_eq!(victim.kinematics.position, rules.respawn_position);
        assert_eq!(victim.kinematics.rotation, rules.respawn_rotation);
    }

    #[test]
    fn apply_kill_is_full_damage() {
        let validator = CombatValidator::new(CombatRules::default());
        let mut entities = table(&[(1, 100), (2, 100)]);

        let outcome = validator.apply_kill(&mut entities, 1, 2, 0).unwrap();
        assert_eq!(outcome.victim_health, 0);
        assert!(outcome.death.is_some());
        assert_eq!(entities[&2].health, 100);
    }

    #[test]
    fn oversized_damage_saturates() {
        let validator = CombatValidator::new(CombatRules::default());
        let mut entities = table(&[(1, 100), (2, 100)]);

        let outcome = validator
            .apply_hit(&mut entities, &hit(1, 2, u32::MAX), 0)
            .unwrap();
        assert_eq!(outcome.victim_health, 0);
    }
}
