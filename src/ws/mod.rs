//! WebSocket transport: binary codec, control messages and the connection task

pub mod codec;
pub mod handler;
pub mod protocol;

use bytes::Bytes;

use self::protocol::ServerMsg;

/// One item on a connection's outbound queue
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A tick's snapshot frame and the input ack that travels with it
    Snapshot { frame: Bytes, ack: Option<Bytes> },
    /// Any other binary packet (player joined / left)
    Binary(Bytes),
    /// JSON control message
    Control(ServerMsg),
}
