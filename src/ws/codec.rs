//! Fixed-layout binary packets for per-tick state
//!
//! All values are big-endian. Every packet starts with an 8-byte header:
//!
//! ```text
//! sequence u16 | packet type u8 | server timestamp u32 | flags u8
//! ```
//!
//! followed by a type-specific body. Entity records are 46 bytes:
//! identity u16, position 3×f32, rotation 4×f32 (x, y, z, w), velocity
//! 3×f32, input bitmask u32.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use glam::{Quat, Vec3};

use crate::game::entity::{EntityState, InputFlags, InputSample, PlayerId, PoseHint};

pub const HEADER_LEN: usize = 8;
pub const ENTITY_RECORD_LEN: usize = 46;

/// Input body without hint: bitmask, roll, speed
const INPUT_BODY_LEN: usize = 12;
/// Position and rotation hint appended when `FLAG_HAS_HINT` is set
const HINT_LEN: usize = 28;

/// Header flag on INPUT packets: a pose hint follows the body
pub const FLAG_HAS_HINT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    StateUpdate = 0x01,
    PlayerJoined = 0x02,
    PlayerLeft = 0x03,
    Input = 0x04,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::StateUpdate),
            0x02 => Ok(Self::PlayerJoined),
            0x03 => Ok(Self::PlayerLeft),
            0x04 => Ok(Self::Input),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u16,
    pub packet_type: PacketType,
    /// Server (or client) millis truncated to 32 bits
    pub timestamp: u32,
    pub flags: u8,
}

/// A decoded binary packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    StateUpdate {
        sequence: u16,
        timestamp: u32,
        entities: Vec<EntityState>,
    },
    PlayerJoined {
        timestamp: u32,
        state: EntityState,
    },
    PlayerLeft {
        timestamp: u32,
        id: PlayerId,
    },
    /// Client input (non-empty INPUT body)
    Input { timestamp: u32, sample: InputSample },
    /// Server acknowledgement of the last applied input (empty INPUT body)
    InputAck { sequence: u16 },
}

/// Codec errors. None of these are fatal for a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("packet truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown packet type 0x{0:02x}")]
    UnknownType(u8),

    #[error("expected {expected:?} packet, got {found:?}")]
    UnexpectedType {
        expected: PacketType,
        found: PacketType,
    },

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// Truncate a millisecond clock to the 32-bit wire field
pub fn wire_timestamp(millis: u64) -> u32 {
    (millis & u32::MAX as u64) as u32
}

fn put_header(buf: &mut BytesMut, header: &PacketHeader) {
    buf.put_u16(header.sequence);
    buf.put_u8(header.packet_type as u8);
    buf.put_u32(header.timestamp);
    buf.put_u8(header.flags);
}

fn put_vec3(buf: &mut BytesMut, v: Vec3) {
    buf.put_f32(v.x);
    buf.put_f32(v.y);
    buf.put_f32(v.z);
}

fn put_quat(buf: &mut BytesMut, q: Quat) {
    buf.put_f32(q.x);
    buf.put_f32(q.y);
    buf.put_f32(q.z);
    buf.put_f32(q.w);
}

fn put_entity(buf: &mut BytesMut, state: &EntityState) {
    buf.put_u16(state.id);
    put_vec3(buf, state.position);
    put_quat(buf, state.rotation);
    put_vec3(buf, state.velocity);
    buf.put_u32(state.input.bits());
}

fn get_vec3(buf: &mut &[u8]) -> Vec3 {
    Vec3::new(buf.get_f32(), buf.get_f32(), buf.get_f32())
}

fn get_quat(buf: &mut &[u8]) -> Quat {
    Quat::from_xyzw(buf.get_f32(), buf.get_f32(), buf.get_f32(), buf.get_f32())
}

/// Caller guarantees `buf.len() >= ENTITY_RECORD_LEN`
fn get_entity(buf: &mut &[u8]) -> EntityState {
    EntityState {
        id: buf.get_u16(),
        position: get_vec3(buf),
        rotation: get_quat(buf),
        velocity: get_vec3(buf),
        input: InputFlags::from_bits_truncate(buf.get_u32()),
    }
}

fn require(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

/// Parse the 8-byte header, advancing `buf` past it
pub fn decode_header(buf: &mut &[u8]) -> Result<PacketHeader, CodecError> {
    require(buf, HEADER_LEN)?;
    let sequence = buf.get_u16();
    let raw_type = buf.get_u8();
    let timestamp = buf.get_u32();
    let flags = buf.get_u8();
    Ok(PacketHeader {
        sequence,
        packet_type: PacketType::try_from(raw_type)?,
        timestamp,
        flags,
    })
}

/// Serialize one tick's entity set
pub fn encode_snapshot(sequence: u16, timestamp_ms: u64, entities: &[EntityState]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + entities.len() * ENTITY_RECORD_LEN);
    put_header(
        &mut buf,
        &PacketHeader {
            sequence,
            packet_type: PacketType::StateUpdate,
            timestamp: wire_timestamp(timestamp_ms),
            flags: 0,
        },
    );
    for state in entities {
        put_entity(&mut buf, state);
    }
    buf.freeze()
}

/// Decode a STATE_UPDATE packet
pub fn decode_snapshot(bytes: &[u8]) -> Result<(PacketHeader, Vec<EntityState>), CodecError> {
    let mut buf = bytes;
    let header = decode_header(&mut buf)?;
    if header.packet_type != PacketType::StateUpdate {
        return Err(CodecError::UnexpectedType {
            expected: PacketType::StateUpdate,
            found: header.packet_type,
        });
    }

    let remainder = buf.len() % ENTITY_RECORD_LEN;
    if remainder != 0 {
        return Err(CodecError::Truncated {
            needed: buf.len() - remainder + ENTITY_RECORD_LEN,
            got: buf.len(),
        });
    }

    let count = buf.len() / ENTITY_RECORD_LEN;
    let mut entities = Vec::with_capacity(count);
    for _ in 0..count {
        entities.push(get_entity(&mut buf));
    }
    Ok((header, entities))
}

pub fn encode_player_joined(timestamp_ms: u64, state: &EntityState) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + ENTITY_RECORD_LEN);
    put_header(
        &mut buf,
        &PacketHeader {
            sequence: 0,
            packet_type: PacketType::PlayerJoined,
            timestamp: wire_timestamp(timestamp_ms),
            flags: 0,
        },
    );
    put_entity(&mut buf, state);
    buf.freeze()
}

pub fn encode_player_left(timestamp_ms: u64, id: PlayerId) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 2);
    put_header(
        &mut buf,
        &PacketHeader {
            sequence: 0,
            packet_type: PacketType::PlayerLeft,
            timestamp: wire_timestamp(timestamp_ms),
            flags: 0,
        },
    );
    buf.put_u16(id);
    buf.freeze()
}

pub fn encode_input(timestamp_ms: u64, sample: &InputSample) -> Bytes {
    let hint_len = if sample.hint.is_some() { HINT_LEN } else { 0 };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + INPUT_BODY_LEN + hint_len);
    put_header(
        &mut buf,
        &PacketHeader {
            sequence: sample.sequence,
            packet_type: PacketType::Input,
            timestamp: wire_timestamp(timestamp_ms),
            flags: if sample.hint.is_some() { FLAG_HAS_HINT } else { 0 },
        },
    );
    buf.put_u32(sample.flags.bits());
    buf.put_f32(sample.roll);
    buf.put_f32(sample.speed);
    if let Some(hint) = &sample.hint {
        put_vec3(&mut buf, hint.position);
        put_quat(&mut buf, hint.rotation);
    }
    buf.freeze()
}

/// Empty-bodied INPUT packet carrying the last applied sequence
pub fn encode_input_ack(sequence: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(
        &mut buf,
        &PacketHeader {
            sequence,
            packet_type: PacketType::Input,
            timestamp: 0,
            flags: 0,
        },
    );
    buf.freeze()
}

/// Decode any binary packet
pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
    let mut buf = bytes;
    let header = decode_header(&mut buf)?;

    let packet = match header.packet_type {
        PacketType::StateUpdate => {
            let (_, entities) = decode_snapshot(bytes)?;
            return Ok(Packet::StateUpdate {
                sequence: header.sequence,
                timestamp: header.timestamp,
                entities,
            });
        }
        PacketType::PlayerJoined => {
            require(buf, ENTITY_RECORD_LEN)?;
            Packet::PlayerJoined {
                timestamp: header.timestamp,
                state: get_entity(&mut buf),
            }
        }
        PacketType::PlayerLeft => {
            require(buf, 2)?;
            Packet::PlayerLeft {
                timestamp: header.timestamp,
                id: buf.get_u16(),
            }
        }
        PacketType::Input if buf.is_empty() => Packet::InputAck {
            sequence: header.sequence,
        },
        PacketType::Input => {
            let has_hint = header.flags & FLAG_HAS_HINT != 0;
            let needed = INPUT_BODY_LEN + if has_hint { HINT_LEN } else { 0 };
            require(buf, needed)?;

            let flags = InputFlags::from_bits_truncate(buf.get_u32());
            let roll = buf.get_f32();
            let speed = buf.get_f32();
            let hint = has_hint.then(|| PoseHint {
                position: get_vec3(&mut buf),
                rotation: get_quat(&mut buf),
            });
            Packet::Input {
                timestamp: header.timestamp,
                sample: InputSample {
                    sequence: header.sequence,
                    flags,
                    roll,
                    speed,
                    hint,
                },
            }
        }
    };

    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes(buf.len()));
    }
    Ok(packet)
}
