//! Client-side sync: prediction for the local entity, interpolation for
//! everyone else, driven by decoded server packets

pub mod clock;
pub mod interpolation;
pub mod movement;
pub mod prediction;

use bytes::Bytes;
use tracing::debug;

use crate::game::entity::{sequence_newer, EntityState, InputFlags, PlayerId};
use crate::game::physics::MotionParams;
use crate::ws::codec::{self, CodecError, Packet};
use crate::ws::protocol::{MovementEvent, ServerMsg};

pub use clock::{ServerClock, TimestampUnwrapper, INTERPOLATION_DELAY_MS};
pub use interpolation::Interpolator;
pub use movement::MovementReporter;
pub use prediction::{PredictionPhase, Predictor, Reconciliation};

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Attach the predicted pose to every input
    pub send_pose_hints: bool,
    pub departure_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub tick_rate_hz: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            send_pose_hints: false,
            departure_timeout_ms: interpolation::DEPARTURE_TIMEOUT_MS,
            heartbeat_ms: movement::HEARTBEAT_MS,
            tick_rate_hz: 60,
        }
    }
}

/// What a received packet did to client state
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Snapshot {
        sequence: u16,
        /// Present when the snapshot carried the local entity
        reconciliation: Option<Reconciliation>,
        departed: Vec<PlayerId>,
    },
    /// Older than a snapshot already applied
    StaleSnapshot { sequence: u16 },
    Joined(PlayerId),
    Left(PlayerId),
    Acknowledged { sequence: u16, dropped: usize },
    Ignored,
}

pub struct SyncClient {
    identity: PlayerId,
    options: ClientOptions,
    predictor: Predictor,
    remotes: Interpolator,
    clock: ServerClock,
    timestamps: TimestampUnwrapper,
    movement: MovementReporter,
    last_snapshot: Option<u16>,
}

impl SyncClient {
    pub fn new(identity: PlayerId, params: MotionParams, options: ClientOptions) -> Self {
        Self {
            identity,
            options,
            predictor: Predictor::new(identity, params, options.tick_rate_hz),
            remotes: Interpolator::new(options.departure_timeout_ms),
            clock: ServerClock::default(),
            timestamps: TimestampUnwrapper::default(),
            movement: MovementReporter::new(options.heartbeat_ms),
            last_snapshot: None,
        }
    }

    pub fn identity(&self) -> PlayerId {
        self.identity
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn remotes(&self) -> &Interpolator {
        &self.remotes
    }

    pub fn clock(&self) -> &ServerClock {
        &self.clock
    }

    /// Predicted state of the local entity
    pub fn local_state(&self) -> Option<EntityState> {
        self.predictor.state()
    }

    /// Record a local input, predict it and encode it for the server
    pub fn input(&mut self, flags: InputFlags, roll: f32, local_ms: u64) -> Bytes {
        let sample = self
            .predictor
            .next_input(flags, roll, self.options.send_pose_hints);
        codec::encode_input(self.clock.server_now(local_ms), &sample)
    }

    /// Movement event to send as a text frame, if one is due
    pub fn movement_event(&mut self, local_ms: u64) -> Option<MovementEvent> {
        let state = self.predictor.state()?;
        self.movement
            .update(local_ms, self.predictor.input(), &state, self.predictor.speed())
    }

    /// Apply one binary frame from the server
    pub fn receive(&mut self, bytes: &[u8], local_ms: u64) -> Result<ClientEvent, CodecError> {
        let event = match codec::decode(bytes)? {
            Packet::StateUpdate {
                sequence,
                timestamp,
                entities,
            } => self.apply_snapshot(sequence, timestamp, &entities, local_ms),
            Packet::PlayerJoined { timestamp, state } => {
                if state.id != self.identity {
                    let server_ms = self.timestamps.widen(timestamp);
                    self.remotes.push(server_ms, state);
                }
                ClientEvent::Joined(state.id)
            }
            Packet::PlayerLeft { id, .. } => {
                self.remotes.remove(id);
                ClientEvent::Left(id)
            }
            Packet::InputAck { sequence } => ClientEvent::Acknowledged {
                sequence,
                dropped: self.predictor.acknowledge(sequence),
            },
            Packet::Input { .. } => ClientEvent::Ignored,
        };
        Ok(event)
    }

    /// Apply the control messages that affect sync state
    pub fn receive_control(&mut self, msg: &ServerMsg, local_ms: u64) -> ClientEvent {
        match msg {
            ServerMsg::Welcome { server_time, .. } => {
                self.clock.observe(*server_time, local_ms);
                ClientEvent::Ignored
            }
            ServerMsg::PlayerLeft { id } => {
                self.remotes.remove(*id);
                ClientEvent::Left(*id)
            }
            _ => ClientEvent::Ignored,
        }
    }

    /// Remote entities as they should be drawn at `local_ms`
    pub fn render(&self, local_ms: u64) -> Vec<EntityState> {
        self.render_at(self.clock.render_time(local_ms))
    }

    pub fn render_at(&self, server_ms: u64) -> Vec<EntityState> {
        self.remotes.render(server_ms)
    }

    fn apply_snapshot(
        &mut self,
        sequence: u16,
        timestamp: u32,
        entities: &[EntityState],
        local_ms: u64,
    ) -> ClientEvent {
        if let Some(last) = self.last_snapshot {
            if !sequence_newer(sequence, last) {
                debug!(sequence, last, "Dropping stale snapshot");
                return ClientEvent::StaleSnapshot { sequence };
            }
        }
        self.last_snapshot = Some(sequence);

        let server_ms = self.timestamps.widen(timestamp);
        self.clock.observe(server_ms, local_ms);

        let mut reconciliation = None;
        for state in entities {
            if state.id == self.identity {
                reconciliation = Some(self.predictor.reconcile(state));
            } else {
                self.remotes.push(server_ms, *state);
            }
        }

        ClientEvent::Snapshot {
            sequence,
            reconciliation,
            departed: self.remotes.prune(server_ms),
        }
    }
}
