//! WebSocket upgrade handler and per-connection tasks

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::entity::PlayerId;
use crate::game::WorldCommand;
use crate::http::AppError;
use crate::session::CloseReason;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::codec::{self, Packet};
use crate::ws::protocol::{ClientMsg, ServerMsg};
use crate::ws::Outbound;

/// Time the writer gets to flush after the reader has finished
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Identity presented by the client
    pub player_id: PlayerId,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, AppError> {
    if query.player_id == 0 {
        return Err(AppError::BadRequest("player_id must be non-zero".to_string()));
    }
    let ws = ws.ok_or(AppError::UpgradeRequired)?;

    info!(player_id = query.player_id, "WebSocket upgrade");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, query.player_id, state)))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, player_id: PlayerId, state: AppState) {
    let admission = state.sessions.admit(player_id).await;
    let token = admission.token;

    let (out_tx, out_rx) = mpsc::channel(state.config.outbound_queue_capacity);
    let joined = state
        .world
        .send(WorldCommand::Join {
            player_id,
            token,
            tx: out_tx.clone(),
        })
        .await;
    if !joined {
        warn!(player_id, "World is not running, dropping connection");
        state.sessions.release(player_id, token).await;
        return;
    }

    let (ws_sink, ws_stream) = socket.split();
    let mut writer = tokio::spawn(run_writer(player_id, ws_sink, out_rx));

    let closed_by = run_reader(player_id, token, ws_stream, &out_tx, admission.closed, &state).await;

    if let Some(reason) = closed_by {
        info!(player_id, token = %token, reason = reason.code(), "Closing connection");
        let _ = out_tx.try_send(Outbound::Control(ServerMsg::Error {
            code: reason.code().to_string(),
            message: match reason {
                CloseReason::Replaced => "Connection replaced by a newer session".to_string(),
                CloseReason::Inactive => "Connection closed after inactivity".to_string(),
            },
        }));
    }
    drop(out_tx);

    // Detaching from the world drops its sender, which ends the writer
    let _ = state.world.send(WorldCommand::Leave { player_id, token }).await;
    state.sessions.release(player_id, token).await;

    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(player_id, token = %token, "WebSocket connection closed");
}

/// Outbound queue -> WebSocket. An input ack is written right before the
/// snapshot it travels with.
async fn run_writer(
    player_id: PlayerId,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = out_rx.recv().await {
        let result = match item {
            Outbound::Snapshot { frame, ack } => {
                let acked = match ack {
                    Some(ack) => ws_sink.feed(Message::Binary(ack.to_vec())).await,
                    None => Ok(()),
                };
                match acked {
                    Ok(()) => ws_sink.send(Message::Binary(frame.to_vec())).await,
                    Err(e) => Err(e),
                }
            }
            Outbound::Binary(bytes) => ws_sink.send(Message::Binary(bytes.to_vec())).await,
            Outbound::Control(msg) => send_msg(&mut ws_sink, &msg).await,
        };

        if let Err(e) = result {
            debug!(player_id, error = %e, "WebSocket send failed");
            break;
        }
    }
    let _ = ws_sink.close().await;
}

/// WebSocket -> world. Returns the registry's close reason when the
/// connection was closed from our side.
async fn run_reader(
    player_id: PlayerId,
    token: Uuid,
    mut ws_stream: SplitStream<WebSocket>,
    out_tx: &mpsc::Sender<Outbound>,
    mut closed: watch::Receiver<Option<CloseReason>>,
    state: &AppState,
) -> Option<CloseReason> {
    let rate_limiter = ConnectionRateLimiter::new(state.config.input_rate_limit);

    loop {
        tokio::select! {
            changed = closed.changed() => {
                let reason = *closed.borrow();
                if reason.is_some() || changed.is_err() {
                    return reason;
                }
            }
            frame = ws_stream.next() => {
                let Some(frame) = frame else {
                    return None;
                };
                let message = match frame {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(player_id, error = %e, "WebSocket error");
                        return None;
                    }
                };
                if let Message::Close(_) = message {
                    info!(player_id, "Client initiated close");
                    return None;
                }

                state.sessions.touch(&token);
                if !rate_limiter.check() {
                    warn!(player_id, "Rate limited inbound message");
                    continue;
                }

                let alive = match message {
                    Message::Binary(bytes) => handle_binary(player_id, token, &bytes, state).await,
                    Message::Text(text) => handle_text(player_id, token, &text, out_tx, state).await,
                    _ => true,
                };
                if !alive {
                    debug!(player_id, "World channel closed");
                    return None;
                }
            }
        }
    }
}

/// Binary frames carry input samples. Malformed packets are dropped and the
/// connection stays open.
async fn handle_binary(player_id: PlayerId, token: Uuid, bytes: &[u8], state: &AppState) -> bool {
    match codec::decode(bytes) {
        Ok(Packet::Input { sample, .. }) => {
            state
                .world
                .send(WorldCommand::Input {
                    player_id,
                    token,
                    sample,
                })
                .await
        }
        Ok(other) => {
            debug!(player_id, packet = ?other, "Ignoring server-bound packet of unexpected type");
            true
        }
        Err(e) => {
            debug!(player_id, error = %e, len = bytes.len(), "Dropping malformed packet");
            true
        }
    }
}

async fn handle_text(
    player_id: PlayerId,
    token: Uuid,
    text: &str,
    out_tx: &mpsc::Sender<Outbound>,
    state: &AppState,
) -> bool {
    let msg = match ClientMsg::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(player_id, error = %e, "Failed to parse client message");
            return true;
        }
    };

    let cmd = match msg {
        ClientMsg::Ping { t } => {
            let _ = out_tx.try_send(Outbound::Control(ServerMsg::Pong { t }));
            return true;
        }
        ClientMsg::Movement(event) => WorldCommand::Movement {
            player_id,
            token,
            event,
        },
        ClientMsg::Hit {
            victim_id,
            damage,
            position,
            distance,
        } => WorldCommand::Hit {
            attacker: player_id,
            token,
            victim: victim_id,
            damage,
            position,
            distance,
        },
        ClientMsg::Kill { victim_id, damage } => WorldCommand::Kill {
            attacker: player_id,
            token,
            victim: victim_id,
            damage,
        },
    };
    state.world.send(cmd).await
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    sink.send(Message::Text(json)).await
}
