//! End-to-end sync scenarios: client and server halves talking through the
//! codec, with the tick loop driven by hand

use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;
use tokio::sync::mpsc;
use uuid::Uuid;

use dogfight_server::client::{ClientEvent, ClientOptions, SyncClient};
use dogfight_server::game::combat::CombatRules;
use dogfight_server::game::physics::MotionParams;
use dogfight_server::game::{InputFlags, PlayerId, TickBroadcaster, World, WorldCommand, WorldHandle};
use dogfight_server::session::{CloseReason, LocalBus, SessionManager};
use dogfight_server::store::{MemoryMatchStore, MemoryStore};
use dogfight_server::ws::codec::{self, Packet};
use dogfight_server::ws::protocol::ServerMsg;
use dogfight_server::ws::Outbound;

fn broadcaster() -> (TickBroadcaster, WorldHandle) {
    let world = World::new(MotionParams::default(), CombatRules::default());
    TickBroadcaster::new(
        world,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryMatchStore::new()),
        60,
    )
}

async fn connect(handle: &WorldHandle, player_id: PlayerId) -> (Uuid, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(64);
    let token = Uuid::new_v4();
    assert!(handle.send(WorldCommand::Join { player_id, token, tx }).await);
    (token, rx)
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// Feed everything queued for a connection into its client, in wire order
fn pump(client: &mut SyncClient, rx: &mut mpsc::Receiver<Outbound>, local_ms: u64) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    for item in drain(rx) {
        match item {
            Outbound::Snapshot { frame, ack } => {
                if let Some(ack) = ack {
                    events.push(client.receive(&ack, local_ms).unwrap());
                }
                events.push(client.receive(&frame, local_ms).unwrap());
            }
            Outbound::Binary(bytes) => events.push(client.receive(&bytes, local_ms).unwrap()),
            Outbound::Control(msg) => events.push(client.receive_control(&msg, local_ms)),
        }
    }
    events
}

fn controls(items: &[Outbound]) -> Vec<ServerMsg> {
    items
        .iter()
        .filter_map(|item| match item {
            Outbound::Control(msg) => Some(msg.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn acknowledged_inputs_leave_nothing_pending() {
    let (mut server, handle) = broadcaster();
    let (token, mut rx) = connect(&handle, 7).await;
    let mut client = SyncClient::new(7, MotionParams::default(), ClientOptions::default());

    // Snapshot 1 seeds the local entity
    assert!(server.run_tick());
    pump(&mut client, &mut rx, 1_000);
    assert!(client.local_state().is_some());

    for (i, flags) in [InputFlags::FORWARD, InputFlags::FORWARD, InputFlags::LEFT]
        .into_iter()
        .enumerate()
    {
        let bytes = client.input(flags, 0.0, 1_005 + i as u64);
        let sample = match codec::decode(&bytes).unwrap() {
            Packet::Input { sample, .. } => sample,
            other => panic!("unexpected packet {:?}", other),
        };
        assert_eq!(sample.sequence, i as u16 + 1);
        assert!(handle.send(WorldCommand::Input { player_id: 7, token, sample }).await);
    }
    assert_eq!(client.predictor().pending_len(), 3);

    // Snapshot 2 carries the ack for sequence 3
    assert!(server.run_tick());
    let events = pump(&mut client, &mut rx, 1_020);

    assert!(events.contains(&ClientEvent::Acknowledged { sequence: 3, dropped: 3 }));
    assert!(events.iter().any(|e| matches!(e, ClientEvent::Snapshot { .. })));
    assert_eq!(client.predictor().pending_len(), 0);
    assert_eq!(server.world().get(7).unwrap().input, InputFlags::LEFT);
}

#[tokio::test]
async fn lethal_hit_is_seen_by_every_peer() {
    let (mut server, handle) = broadcaster();
    let (attacker_token, mut a) = connect(&handle, 1).await;
    let (_, mut v) = connect(&handle, 2).await;
    let (_, mut o) = connect(&handle, 3).await;
    assert!(server.run_tick());
    for rx in [&mut a, &mut v, &mut o] {
        drain(rx);
    }

    assert!(
        handle
            .send(WorldCommand::Hit {
                attacker: 1,
                token: attacker_token,
                victim: 2,
                damage: 100,
                position: Vec3::new(0.0, 100.0, 0.0),
                distance: 50.0,
            })
            .await
    );
    assert!(server.run_tick());

    let rules = CombatRules::default();
    for rx in [&mut a, &mut v, &mut o] {
        let items = drain(rx);
        let msgs = controls(&items);
        assert!(msgs.contains(&ServerMsg::PlayerDeath {
            victim_id: 2,
            attacker_id: 1,
            respawn_position: rules.respawn_position,
        }));

        // The same tick's snapshot already shows the victim near the respawn point
        let respawned = items.iter().find_map(|item| match item {
            Outbound::Snapshot { frame, .. } => {
                let (_, entities) = codec::decode_snapshot(frame).ok()?;
                entities.into_iter().find(|e| e.id == 2)
            }
            _ => None,
        });
        let respawned = respawned.expect("snapshot with victim");
        assert!(respawned.position.distance(rules.respawn_position) < 5.0);
    }

    assert_eq!(server.world().get(2).unwrap().health, rules.max_health);
}

#[tokio::test]
async fn duplicate_identity_leaves_one_active_connection() {
    let store = MemoryStore::new();
    let sessions = SessionManager::new(
        Uuid::new_v4(),
        Arc::new(store.clone()),
        Arc::new(LocalBus::new()),
        Duration::from_secs(120),
    );
    let (mut server, handle) = broadcaster();

    let first = sessions.admit(7).await;
    let (_, mut first_rx) = connect_with(&handle, 7, first.token).await;
    let second = sessions.admit(7).await;
    let (_, mut second_rx) = connect_with(&handle, 7, second.token).await;

    assert_eq!(*first.closed.borrow(), Some(CloseReason::Replaced));
    assert_eq!(sessions.active_token(7), Some(second.token));
    assert_eq!(sessions.connection_count(), 1);

    // The replaced connection tears down after the new one joined
    assert!(handle.send(WorldCommand::Leave { player_id: 7, token: first.token }).await);
    sessions.release(7, first.token).await;
    assert!(server.run_tick());

    assert!(server.world().contains(7));
    assert_eq!(server.world().len(), 1);
    assert_eq!(sessions.active_token(7), Some(second.token));
    assert!(sessions.is_live(&second.token));

    let snapshots = |items: Vec<Outbound>| {
        items
            .into_iter()
            .filter(|item| matches!(item, Outbound::Snapshot { .. }))
            .count()
    };
    assert_eq!(snapshots(drain(&mut first_rx)), 0);
    assert_eq!(snapshots(drain(&mut second_rx)), 1);
}

async fn connect_with(
    handle: &WorldHandle,
    player_id: PlayerId,
    token: Uuid,
) -> (Uuid, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(64);
    assert!(handle.send(WorldCommand::Join { player_id, token, tx }).await);
    (token, rx)
}
