//! Remote entity interpolation
//!
//! Every remote identity keeps its last three authoritative samples. A render
//! timestamp between two samples is interpolated (lerp for position and
//! velocity, slerp for rotation); past the newest sample the entity is
//! extrapolated along its velocity for a short, capped time.

use std::collections::{HashMap, VecDeque};

use crate::game::entity::{EntityState, PlayerId};

/// Samples kept per remote entity
pub const BUFFER_LEN: usize = 3;
/// Longest extrapolation past the newest sample
pub const MAX_EXTRAPOLATION_MS: u64 = 200;
/// Remote entities without a sample for this long are considered gone
pub const DEPARTURE_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    timestamp_ms: u64,
    state: EntityState,
}

#[derive(Debug, Default)]
struct RemoteEntity {
    samples: VecDeque<Sample>,
}

impl RemoteEntity {
    fn push(&mut self, sample: Sample) -> bool {
        if let Some(newest) = self.samples.back() {
            if sample.timestamp_ms <= newest.timestamp_ms {
                return false;
            }
        }
        self.samples.push_back(sample);
        while self.samples.len() > BUFFER_LEN {
            self.samples.pop_front();
        }
        true
    }

    fn newest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    fn sample_at(&self, render_ms: u64, max_extrapolation_ms: u64) -> Option<EntityState> {
        let newest = self.samples.back()?;
        if self.samples.len() < 2 {
            return Some(newest.state);
        }

        if render_ms >= newest.timestamp_ms {
            let ahead = (render_ms - newest.timestamp_ms).min(max_extrapolation_ms);
            let mut state = newest.state;
            state.position += state.velocity * (ahead as f32 / 1000.0);
            return Some(state);
        }

        let oldest = self.samples.front()?;
        if render_ms <= oldest.timestamp_ms {
            return Some(oldest.state);
        }

        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .find(|(a, b)| a.timestamp_ms <= render_ms && render_ms <= b.timestamp_ms)
            .map(|(a, b)| interpolate(a, b, render_ms))
    }
}

fn interpolate(a: &Sample, b: &Sample, render_ms: u64) -> EntityState {
    let span = b.timestamp_ms - a.timestamp_ms;
    let alpha = if span == 0 {
        1.0
    } else {
        ((render_ms - a.timestamp_ms) as f32 / span as f32).clamp(0.0, 1.0)
    };

    EntityState {
        id: b.state.id,
        position: a.state.position.lerp(b.state.position, alpha),
        rotation: a.state.rotation.slerp(b.state.rotation, alpha),
        velocity: a.state.velocity.lerp(b.state.velocity, alpha),
        input: if alpha < 1.0 { a.state.input } else { b.state.input },
    }
}

/// Interpolation buffers for every remote entity
#[derive(Debug)]
pub struct Interpolator {
    entities: HashMap<PlayerId, RemoteEntity>,
    departure_timeout_ms: u64,
    max_extrapolation_ms: u64,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new(DEPARTURE_TIMEOUT_MS)
    }
}

impl Interpolator {
    pub fn new(departure_timeout_ms: u64) -> Self {
        Self {
            entities: HashMap::new(),
            departure_timeout_ms,
            max_extrapolation_ms: MAX_EXTRAPOLATION_MS,
        }
    }

    /// Buffer one authoritative sample. Samples not newer than the newest
    /// buffered one for that identity are ignored.
    pub fn push(&mut self, timestamp_ms: u64, state: EntityState) -> bool {
        self.entities
            .entry(state.id)
            .or_default()
            .push(Sample {
                timestamp_ms,
                state,
            })
    }

    pub fn remove(&mut self, id: PlayerId) -> bool {
        self.entities.remove(&id).is_some()
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

    pub fn buffered(&self, id: PlayerId) -> usize {
        self.entities.get(&id).map(|e| e.samples.len()).unwrap_or(0)
    }

    /// State of `id` at `render_ms` (server clock)
    pub fn sample(&self, id: PlayerId, render_ms: u64) -> Option<EntityState> {
        self.entities
            .get(&id)?
            .sample_at(render_ms, self.max_extrapolation_ms)
    }

    /// Every remote entity at `render_ms`, ordered by identity
    pub fn render(&self, render_ms: u64) -> Vec<EntityState> {
        let mut states: Vec<EntityState> = self
            .entities
            .values()
            .filter_map(|e| e.sample_at(render_ms, self.max_extrapolation_ms))
            .collect();
        states.sort_by_key(|s| s.id);
        states
    }

    /// Drop entities whose newest sample is older than the departure
    /// timeout relative to `server_now_ms`. Returns the departed identities.
    pub fn prune(&mut self, server_now_ms: u64) -> Vec<PlayerId> {
        let cutoff = server_now_ms.saturating_sub(self.departure_timeout_ms);
        let mut departed: Vec<PlayerId> = self
            .entities
            .iter()
            .filter(|(_, e)| e.newest().map_or(true, |s| s.timestamp_ms < cutoff))
            .map(|(&id, _)| id)
            .collect();
        for id in &departed {
            self.entities.remove(id);
        }
        departed.sort_unstable();
        departed
    }
}
