//! Authoritative tick loop
//!
//! `TickBroadcaster` is the single owner of the `World`. Connection tasks
//! talk to it only through `WorldHandle`; commands are drained at the start
//! of every tick, so no two mutations of an entity can interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use glam::Vec3;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::side::{match_members_key, SideStore, MATCH_MEMBERS_TTL};
use crate::store::stats::{MatchStore, PlayerStats};
use crate::util::background::spawn_best_effort;
use crate::util::time::{tick_delta, tick_period};
use crate::ws::codec;
use crate::ws::protocol::{MovementEvent, PlayerView, ServerMsg};
use crate::ws::Outbound;

use super::combat::{DeathEvent, HitIntent, HitOutcome, KILL_DAMAGE};
use super::entity::{InputSample, InputSequencer, PlayerId};
use super::scoreboard::{Scoreboard, KILL_SCORE};
use super::snapshot::{SnapshotBuilder, SnapshotStats};
use super::world::World;

const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Match lifecycle errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("match {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("match {0} is not running")]
    NotRunning(Uuid),

    #[error("world task is not running")]
    WorldStopped,
}

/// Requests from connection tasks and HTTP handlers to the world owner.
/// Per-connection commands carry the connection token; commands from a
/// replaced connection are ignored.
pub enum WorldCommand {
    Join {
        player_id: PlayerId,
        token: Uuid,
        tx: mpsc::Sender<Outbound>,
    },
    Leave {
        player_id: PlayerId,
        token: Uuid,
    },
    Input {
        player_id: PlayerId,
        token: Uuid,
        sample: InputSample,
    },
    Movement {
        player_id: PlayerId,
        token: Uuid,
        event: MovementEvent,
    },
    Hit {
        attacker: PlayerId,
        token: Uuid,
        victim: PlayerId,
        damage: u32,
        position: Vec3,
        distance: f32,
    },
    Kill {
        attacker: PlayerId,
        token: Uuid,
        victim: PlayerId,
        damage: u32,
    },
    StartMatch {
        reply: oneshot::Sender<Result<Uuid, MatchError>>,
    },
    EndMatch {
        match_id: Uuid,
        reply: oneshot::Sender<Result<Vec<PlayerStats>, MatchError>>,
    },
}

/// Counters published by the tick loop for the health endpoint
#[derive(Debug, Default)]
pub struct WorldStats {
    tick: AtomicU64,
    players: AtomicUsize,
}

/// Cloneable handle to the running world
#[derive(Clone)]
pub struct WorldHandle {
    cmd_tx: mpsc::Sender<WorldCommand>,
    stats: Arc<WorldStats>,
}

impl WorldHandle {
    /// Queue a command; false once the world task has stopped
    pub async fn send(&self, cmd: WorldCommand) -> bool {
        self.cmd_tx.send(cmd).await.is_ok()
    }

    pub fn tick(&self) -> u64 {
        self.stats.tick.load(Ordering::Relaxed)
    }

    pub fn player_count(&self) -> usize {
        self.stats.players.load(Ordering::Relaxed)
    }

    pub async fn start_match(&self) -> Result<Uuid, MatchError> {
        let (reply, rx) = oneshot::channel();
        if !self.send(WorldCommand::StartMatch { reply }).await {
            return Err(MatchError::WorldStopped);
        }
        rx.await.map_err(|_| MatchError::WorldStopped)?
    }

    pub async fn end_match(&self, match_id: Uuid) -> Result<Vec<PlayerStats>, MatchError> {
        let (reply, rx) = oneshot::channel();
        if !self.send(WorldCommand::EndMatch { match_id, reply }).await {
            return Err(MatchError::WorldStopped);
        }
        rx.await.map_err(|_| MatchError::WorldStopped)?
    }
}

/// A connection attached to an entity
struct Peer {
    token: Uuid,
    tx: mpsc::Sender<Outbound>,
    sequencer: InputSequencer,
}

/// Non-blocking enqueue. A full queue drops the item for this peer only.
fn deliver(player_id: PlayerId, peer: &Peer, item: Outbound) -> bool {
    match peer.tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!(player_id, "Outbound queue full, dropping message");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(player_id, "Outbound queue closed");
            false
        }
    }
}

/// The authoritative world task
pub struct TickBroadcaster {
    world: World,
    peers: HashMap<PlayerId, Peer>,
    cmd_rx: mpsc::Receiver<WorldCommand>,
    snapshots: SnapshotBuilder,
    snapshot_stats: SnapshotStats,
    scoreboard: Scoreboard,
    current_match: Option<Uuid>,
    side_store: Arc<dyn SideStore>,
    match_store: Arc<dyn MatchStore>,
    stats: Arc<WorldStats>,
    tick_rate_hz: u32,
    tick: u64,
    epoch: Instant,
}

impl TickBroadcaster {
    pub fn new(
        world: World,
        side_store: Arc<dyn SideStore>,
        match_store: Arc<dyn MatchStore>,
        tick_rate_hz: u32,
    ) -> (Self, WorldHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let stats = Arc::new(WorldStats::default());

        let handle = WorldHandle {
            cmd_tx,
            stats: stats.clone(),
        };

        let broadcaster = Self {
            world,
            peers: HashMap::new(),
            cmd_rx,
            snapshots: SnapshotBuilder::new(),
            snapshot_stats: SnapshotStats::default(),
            scoreboard: Scoreboard::new(),
            current_match: None,
            side_store,
            match_store,
            stats,
            tick_rate_hz: tick_rate_hz.max(1),
            tick: 0,
            epoch: Instant::now(),
        };

        (broadcaster, handle)
    }

    /// Milliseconds since this world started
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn current_match(&self) -> Option<Uuid> {
        self.current_match
    }

    /// Run the fixed-rate tick loop until every handle is dropped
    pub async fn run(mut self) {
        info!(tick_rate_hz = self.tick_rate_hz, "Tick broadcaster started");

        let mut ticker = interval(tick_period(self.tick_rate_hz));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.run_tick() {
                break;
            }
        }

        info!(
            ticks = self.tick,
            snapshots = self.snapshot_stats.total_snapshots,
            dropped = self.snapshot_stats.dropped,
            "Tick broadcaster stopped"
        );
    }

    /// One tick: apply queued commands, integrate, fan out the snapshot.
    /// Returns false when the command channel has closed.
    pub fn run_tick(&mut self) -> bool {
        let open = self.process_commands();

        self.world.step(tick_delta(self.tick_rate_hz));
        self.tick += 1;
        self.broadcast_snapshot();

        self.stats.tick.store(self.tick, Ordering::Relaxed);
        self.stats.players.store(self.world.len(), Ordering::Relaxed);

        if self.tick % (self.tick_rate_hz as u64 * 60) == 0 {
            debug!(
                tick = self.tick,
                players = self.world.len(),
                avg_entities = self.snapshot_stats.avg_entities_per_snapshot,
                total_bytes = self.snapshot_stats.total_bytes,
                dropped = self.snapshot_stats.dropped,
                "Snapshot stats"
            );
        }
        open
    }

    fn process_commands(&mut self) -> bool {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_command(&mut self, cmd: WorldCommand) {
        match cmd {
            WorldCommand::Join {
                player_id,
                token,
                tx,
            } => self.handle_join(player_id, token, tx),
            WorldCommand::Leave { player_id, token } => self.handle_leave(player_id, token),
            WorldCommand::Input {
                player_id,
                token,
                sample,
            } => self.handle_input(player_id, token, sample),
            WorldCommand::Movement {
                player_id,
                token,
                event,
            } => {
                if self.is_current(player_id, token) {
                    self.broadcast_except(
                        player_id,
                        Outbound::Control(ServerMsg::PlayerMovement { player_id, event }),
                    );
                }
            }
            WorldCommand::Hit {
                attacker,
                token,
                victim,
                damage,
                position,
                distance,
            } => {
                if !self.is_current(attacker, token) {
                    return;
                }
                let intent = HitIntent {
                    attacker,
                    victim,
                    damage,
                    point: position,
                    distance,
                };
                self.handle_hit(&intent);
            }
            WorldCommand::Kill {
                attacker,
                token,
                victim,
                damage,
            } => {
                if self.is_current(attacker, token) {
                    self.handle_kill(attacker, victim, damage);
                }
            }
            WorldCommand::StartMatch { reply } => {
                let _ = reply.send(self.start_match());
            }
            WorldCommand::EndMatch { match_id, reply } => {
                let _ = reply.send(self.end_match(match_id));
            }
        }
    }

    fn is_current(&self, player_id: PlayerId, token: Uuid) -> bool {
        match self.peers.get(&player_id) {
            Some(peer) if peer.token == token => true,
            _ => {
                debug!(player_id, token = %token, "Ignoring command from replaced connection");
                false
            }
        }
    }

    /// Attach a connection to its entity, spawning the entity if needed
    fn handle_join(&mut self, player_id: PlayerId, token: Uuid, tx: mpsc::Sender<Outbound>) {
        let is_new = !self.world.contains(player_id);
        let state = self.world.spawn(player_id);
        let now = self.now_ms();

        let peer = Peer {
            token,
            tx,
            sequencer: InputSequencer::default(),
        };
        if let Some(previous) = self.peers.insert(player_id, peer) {
            info!(player_id, stale_token = %previous.token, "Connection replaced in world");
        }

        let players: Vec<PlayerView> = self
            .world
            .states()
            .into_iter()
            .filter_map(|state| {
                self.world.get(state.id).map(|entity| PlayerView {
                    id: state.id,
                    state,
                    health: entity.health,
                })
            })
            .collect();

        if let Some(peer) = self.peers.get(&player_id) {
            deliver(
                player_id,
                peer,
                Outbound::Control(ServerMsg::Welcome {
                    identity: player_id,
                    server_time: now,
                }),
            );
            deliver(player_id, peer, Outbound::Control(ServerMsg::AllPlayers { players }));
        }

        if is_new {
            self.broadcast_except(
                player_id,
                Outbound::Control(ServerMsg::PlayerJoined {
                    id: player_id,
                    state,
                }),
            );
            self.broadcast_except(
                player_id,
                Outbound::Binary(codec::encode_player_joined(now, &state)),
            );
        }

        if let Some(match_id) = self.current_match {
            self.scoreboard.enroll(player_id);
            self.add_match_member(match_id, player_id);
        }

        info!(player_id, token = %token, players = self.world.len(), "Player joined world");
    }

    fn handle_leave(&mut self, player_id: PlayerId, token: Uuid) {
        if !self.is_current(player_id, token) {
            return;
        }
        self.peers.remove(&player_id);
        self.world.remove(player_id);

        let now = self.now_ms();
        self.broadcast(ServerMsg::PlayerLeft { id: player_id });
        self.broadcast_except(
            player_id,
            Outbound::Binary(codec::encode_player_left(now, player_id)),
        );

        info!(player_id, players = self.world.len(), "Player left world");
    }

    fn handle_input(&mut self, player_id: PlayerId, token: Uuid, sample: InputSample) {
        let Some(peer) = self.peers.get_mut(&player_id) else {
            return;
        };
        if peer.token != token {
            return;
        }
        if !peer.sequencer.accept(sample.sequence) {
            debug!(
                player_id,
                seq = sample.sequence,
                last = ?peer.sequencer.last(),
                "Discarding out-of-order input"
            );
            return;
        }
        self.world.apply_input(player_id, &sample);
    }

    fn handle_hit(&mut self, intent: &HitIntent) {
        let now = self.now_ms();
        match self.world.apply_hit(intent, now) {
            Ok(outcome) => self.on_hit(intent, outcome),
            Err(rejection) => {
                info!(
                    attacker = intent.attacker,
                    victim = intent.victim,
                    reason = %rejection,
                    "Hit rejected"
                );
            }
        }
    }

    fn handle_kill(&mut self, attacker: PlayerId, victim: PlayerId, damage: u32) {
        let now = self.now_ms();
        let point = self
            .world
            .get(victim)
            .map(|v| v.kinematics.position)
            .unwrap_or(Vec3::ZERO);
        let intent = HitIntent {
            attacker,
            victim,
            damage,
            point,
            distance: 0.0,
        };
        let result = if damage == KILL_DAMAGE {
            self.world.apply_kill(attacker, victim, now)
        } else {
            self.world.apply_hit(&intent, now)
        };

        match result {
            Ok(outcome) => match outcome.death {
                Some(death) => {
                    self.broadcast(ServerMsg::PlayerKilled {
                        attacker_id: attacker,
                        victim_id: victim,
                    });
                    self.on_death(death);
                }
                None => self.on_hit(&intent, outcome),
            },
            Err(rejection) => {
                info!(attacker, victim, reason = %rejection, "Kill rejected");
            }
        }
    }

    fn on_hit(&mut self, intent: &HitIntent, outcome: HitOutcome) {
        self.broadcast(ServerMsg::PlayerHit {
            attacker_id: intent.attacker,
            victim_id: intent.victim,
            damage: intent.damage,
            victim_health: outcome.victim_health,
            position: intent.point,
            distance: intent.distance,
        });
        if let Some(death) = outcome.death {
            self.on_death(death);
        }
    }

    fn on_death(&mut self, death: DeathEvent) {
        info!(victim = death.victim, attacker = death.attacker, "Player died");

        self.broadcast(ServerMsg::PlayerDeath {
            victim_id: death.victim,
            attacker_id: death.attacker,
            respawn_position: death.respawn_position,
        });

        if let Some(match_id) = self.current_match {
            self.scoreboard.record_kill(death.attacker, death.victim);
            let store = self.match_store.clone();
            spawn_best_effort("record_kill", async move {
                store
                    .record_kill(match_id, death.attacker, death.victim, KILL_SCORE)
                    .await
            });
        }
    }

    fn start_match(&mut self) -> Result<Uuid, MatchError> {
        if let Some(running) = self.current_match {
            return Err(MatchError::AlreadyRunning(running));
        }

        let match_id = Uuid::new_v4();
        self.current_match = Some(match_id);
        self.scoreboard.reset();

        let members: Vec<PlayerId> = self.world.states().iter().map(|s| s.id).collect();
        for &player_id in &members {
            self.scoreboard.enroll(player_id);
            self.add_match_member(match_id, player_id);
        }

        let store = self.match_store.clone();
        let started_at = Utc::now();
        spawn_best_effort("create_match", async move {
            store.create_match(match_id, started_at).await
        });

        self.broadcast(ServerMsg::MatchStarted { match_id });
        info!(match_id = %match_id, players = members.len(), "Match started");
        Ok(match_id)
    }

    fn end_match(&mut self, match_id: Uuid) -> Result<Vec<PlayerStats>, MatchError> {
        if self.current_match != Some(match_id) {
            return Err(MatchError::NotRunning(match_id));
        }
        self.current_match = None;

        let standings = self.scoreboard.standings();
        let store = self.match_store.clone();
        let ended_at = Utc::now();
        let persisted = standings.clone();
        spawn_best_effort("end_match", async move {
            store.end_match(match_id, ended_at, persisted).await
        });

        self.broadcast(ServerMsg::MatchEnded { match_id });
        info!(match_id = %match_id, players = standings.len(), "Match ended");
        Ok(standings)
    }

    fn add_match_member(&self, match_id: Uuid, player_id: PlayerId) {
        let store = self.side_store.clone();
        spawn_best_effort("add_match_member", async move {
            store
                .add_member(
                    &match_members_key(&match_id),
                    player_id.to_string(),
                    MATCH_MEMBERS_TTL,
                )
                .await
        });
    }

    /// Serialize the world once and enqueue it, with each peer's input ack,
    /// on every connection without blocking
    fn broadcast_snapshot(&mut self) {
        if self.peers.is_empty() {
            return;
        }

        let now = self.now_ms();
        let snapshot = self.snapshots.build(now, self.world.states());
        let frame = snapshot.encode();
        self.snapshot_stats.record(snapshot.entities.len(), frame.len());

        let mut dropped = 0;
        for (&player_id, peer) in &self.peers {
            let ack = peer.sequencer.last().map(codec::encode_input_ack);
            let item = Outbound::Snapshot {
                frame: frame.clone(),
                ack,
            };
            if !deliver(player_id, peer, item) {
                dropped += 1;
            }
        }
        for _ in 0..dropped {
            self.snapshot_stats.record_drop();
        }
    }

    fn broadcast(&self, msg: ServerMsg) {
        for (&player_id, peer) in &self.peers {
            deliver(player_id, peer, Outbound::Control(msg.clone()));
        }
    }

    fn broadcast_except(&self, skip: PlayerId, item: Outbound) {
        for (&player_id, peer) in &self.peers {
            if player_id != skip {
                deliver(player_id, peer, item.clone());
            }
        }
    }
}
