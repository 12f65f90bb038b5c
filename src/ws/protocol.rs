//! Structured control messages (JSON text frames)
//! These carry connection lifecycle and combat, never per-tick motion

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::combat::KILL_DAMAGE;
use crate::game::entity::{EntityState, InputFlags, PlayerId};

/// Coarse movement intent, sent when the input bitmask changes or on a
/// heartbeat. Supplements snapshots; never replaces them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementEvent {
    pub input: InputFlags,
    pub position: Vec3,
    pub rotation: Quat,
    pub speed: f32,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMsg {
    /// Movement intent
    Movement(MovementEvent),

    /// Claimed hit on another player
    #[serde(rename_all = "camelCase")]
    Hit {
        victim_id: PlayerId,
        damage: u32,
        position: Vec3,
        distance: f32,
    },

    /// Direct full-damage kill
    #[serde(rename_all = "camelCase")]
    Kill {
        victim_id: PlayerId,
        #[serde(default = "default_kill_damage")]
        damage: u32,
    },

    /// Liveness probe
    Ping {
        /// Client timestamp
        t: u64,
    },
}

fn default_kill_damage() -> u32 {
    KILL_DAMAGE
}

/// A control message that failed boundary validation
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("non-finite {0}")]
    NonFinite(&'static str),

    #[error("damage must be positive")]
    ZeroDamage,
}

impl ClientMsg {
    /// Parse and validate a text frame before it reaches the core
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let msg: ClientMsg = serde_json::from_str(text)?;
        msg.validate()?;
        Ok(msg)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientMsg::Movement(event) => {
                if !event.position.is_finite() {
                    return Err(ProtocolError::NonFinite("position"));
                }
                if !event.rotation.is_finite() {
                    return Err(ProtocolError::NonFinite("rotation"));
                }
                if !event.speed.is_finite() {
                    return Err(ProtocolError::NonFinite("speed"));
                }
            }
            ClientMsg::Hit {
                damage,
                position,
                distance,
                ..
            } => {
                if *damage == 0 {
                    return Err(ProtocolError::ZeroDamage);
                }
                if !position.is_finite() {
                    return Err(ProtocolError::NonFinite("position"));
                }
                if !distance.is_finite() {
                    return Err(ProtocolError::NonFinite("distance"));
                }
            }
            ClientMsg::Kill { damage, .. } => {
                if *damage == 0 {
                    return Err(ProtocolError::ZeroDamage);
                }
            }
            ClientMsg::Ping { .. } => {}
        }
        Ok(())
    }
}

/// Player info for the roster sent on join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    pub id: PlayerId,
    pub state: EntityState,
    pub health: u16,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMsg {
    /// Sent once after the handshake
    #[serde(rename_all = "camelCase")]
    Welcome { identity: PlayerId, server_time: u64 },

    PlayerJoined { id: PlayerId, state: EntityState },

    PlayerLeft { id: PlayerId },

    /// Roster sent to a newly admitted connection
    AllPlayers { players: Vec<PlayerView> },

    #[serde(rename_all = "camelCase")]
    PlayerMovement {
        player_id: PlayerId,
        event: MovementEvent,
    },

    #[serde(rename_all = "camelCase")]
    PlayerHit {
        attacker_id: PlayerId,
        victim_id: PlayerId,
        damage: u32,
        victim_health: u16,
        position: Vec3,
        distance: f32,
    },

    #[serde(rename_all = "camelCase")]
    PlayerDeath {
        victim_id: PlayerId,
        attacker_id: PlayerId,
        respawn_position: Vec3,
    },

    #[serde(rename_all = "camelCase")]
    PlayerKilled {
        attacker_id: PlayerId,
        victim_id: PlayerId,
    },

    #[serde(rename_all = "camelCase")]
    MatchStarted { match_id: Uuid },

    #[serde(rename_all = "camelCase")]
    MatchEnded { match_id: Uuid },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },

    /// Sent right before the server closes a connection
    Error { code: String, message: String },
}
