//! Per-match kill / death / score tally

use std::collections::HashMap;

use crate::store::stats::PlayerStats;

use super::entity::PlayerId;

/// Score awarded to the killer for each death
pub const KILL_SCORE: u32 = 100;

#[derive(Debug, Default)]
pub struct Scoreboard {
    entries: HashMap<PlayerId, PlayerStats>,
}

impl Scoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Make sure a participant appears in the standings even without kills
    pub fn enroll(&mut self, player_id: PlayerId) {
        self.entry(player_id);
    }

    pub fn record_kill(&mut self, killer: PlayerId, victim: PlayerId) {
        let k = self.entry(killer);
        k.kills += 1;
        k.score += KILL_SCORE;
        self.entry(victim).deaths += 1;
    }

    pub fn get(&self, player_id: PlayerId) -> Option<&PlayerStats> {
        self.entries.get(&player_id)
    }

    /// Best score first, ties broken by fewer deaths then identity
    pub fn standings(&self) -> Vec<PlayerStats> {
        let mut standings: Vec<PlayerStats> = self.entries.values().copied().collect();
        standings.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.deaths.cmp(&b.deaths))
                .then(a.player_id.cmp(&b.player_id))
        });
        standings
    }

    fn entry(&mut self, player_id: PlayerId) -> &mut PlayerStats {
        self.entries.entry(player_id).or_insert_with(|| PlayerStats {
            player_id,
            ..Default::default()
        })
    }
}
