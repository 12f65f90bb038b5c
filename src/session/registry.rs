//! Connection registry: at most one live connection per identity

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::entity::PlayerId;
use crate::store::side::{
    connection_key, session_key, SideStore, StoreError, CONNECTION_TTL, SESSION_TTL,
};
use crate::util::background::spawn_best_effort;
use crate::util::time::unix_millis;

use super::bus::{ReconciliationBus, TakeoverNotice, TakeoverReason};

/// Minimum spacing between connection-record TTL refreshes
const STORE_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Per-identity connection record in the side store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub identity: PlayerId,
    pub token: Uuid,
    pub process_id: Uuid,
    pub connected_at: u64,
}

/// Per-identity session record in the side store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub identity: PlayerId,
    pub last_token: Uuid,
    pub process_id: Uuid,
    pub started_at: u64,
}

/// Why the registry closed a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection for the same identity took over
    Replaced,
    /// No inbound traffic within the inactivity threshold
    Inactive,
}

impl CloseReason {
    pub fn code(self) -> &'static str {
        match self {
            CloseReason::Replaced => "replaced",
            CloseReason::Inactive => "inactive",
        }
    }
}

/// Result of admitting a connection
pub struct Admission {
    pub identity: PlayerId,
    pub token: Uuid,
    /// Becomes `Some` when the registry wants this connection closed
    pub closed: watch::Receiver<Option<CloseReason>>,
}

struct LocalConnection {
    identity: PlayerId,
    /// Millis since the manager's epoch
    last_seen: AtomicU64,
    last_store_refresh: AtomicU64,
    /// Stored connection record, refreshed only while the store still holds it
    record: Option<String>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

/// Admission, liveness and takeover for the connections of this process
pub struct SessionManager {
    process_id: Uuid,
    store: Arc<dyn SideStore>,
    bus: Arc<dyn ReconciliationBus>,
    /// Connections owned by this process, keyed by token
    local: DashMap<Uuid, LocalConnection>,
    /// Active token per identity among local connections
    active: DashMap<PlayerId, Uuid>,
    /// Per-identity locks making lookup-then-register atomic for one identity
    admission: DashMap<PlayerId, Arc<Mutex<()>>>,
    inactivity_timeout: Duration,
    epoch: Instant,
}

impl SessionManager {
    pub fn new(
        process_id: Uuid,
        store: Arc<dyn SideStore>,
        bus: Arc<dyn ReconciliationBus>,
        inactivity_timeout: Duration,
    ) -> Self {
        Self {
            process_id,
            store,
            bus,
            local: DashMap::new(),
            active: DashMap::new(),
            admission: DashMap::new(),
            inactivity_timeout,
            epoch: Instant::now(),
        }
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn identity_lock(&self, identity: PlayerId) -> Arc<Mutex<()>> {
        self.admission.entry(identity).or_default().clone()
    }

    /// Number of live connections owned by this process
    pub fn connection_count(&self) -> usize {
        self.local.len()
    }

    pub fn is_live(&self, token: &Uuid) -> bool {
        self.local.contains_key(token)
    }

    /// Token of this process's active connection for `identity`
    pub fn active_token(&self, identity: PlayerId) -> Option<Uuid> {
        self.active.get(&identity).map(|t| *t)
    }

    /// Admit a new connection, taking over any existing one for the identity.
    ///
    /// Never waits on the stale connection actually closing: a first-time
    /// connection and a takeover are registered the same way.
    pub async fn admit(&self, identity: PlayerId) -> Admission {
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;
        let key = connection_key(identity);

        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<ConnectionRecord>(&raw) {
                Ok(stale) => self.take_over(&key, stale).await,
                Err(e) => {
                    warn!(player_id = identity, error = %e, "Discarding unreadable connection record");
                    if let Err(e) = self.store.delete(&key).await {
                        warn!(player_id = identity, error = %e, "Failed to delete connection record");
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(player_id = identity, error = %e, "Side store read failed, admitting without arbitration");
            }
        }

        // The store may have lost the record (expiry, outage); local state
        // still knows about our own connections.
        if let Some((_, previous)) = self.active.remove(&identity) {
            if self.close_local(previous, CloseReason::Replaced) {
                info!(player_id = identity, token = %previous, "Closed local connection missing from side store");
            }
        }

        let token = Uuid::new_v4();
        let connected_at = unix_millis();
        let record = ConnectionRecord {
            identity,
            token,
            process_id: self.process_id,
            connected_at,
        };
        let session = SessionRecord {
            identity,
            last_token: token,
            process_id: self.process_id,
            started_at: connected_at,
        };
        let record_json = match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = self
                    .store
                    .set_with_ttl(&key, json.clone(), CONNECTION_TTL)
                    .await
                {
                    warn!(player_id = identity, error = %e, "Failed to write connection record");
                }
                Some(json)
            }
            Err(e) => {
                warn!(player_id = identity, error = %e, "Failed to encode connection record");
                None
            }
        };
        match serde_json::to_string(&session) {
            Ok(json) => {
                if let Err(e) = self
                    .store
                    .set_with_ttl(&session_key(identity), json, SESSION_TTL)
                    .await
                {
                    warn!(player_id = identity, error = %e, "Failed to write session record");
                }
            }
            Err(e) => warn!(player_id = identity, error = %e, "Failed to encode session record"),
        }

        let now = self.now_ms();
        let (close_tx, closed) = watch::channel(None);
        self.local.insert(
            token,
            LocalConnection {
                identity,
                last_seen: AtomicU64::new(now),
                last_store_refresh: AtomicU64::new(now),
                record: record_json,
                close_tx,
            },
        );
        self.active.insert(identity, token);

        info!(player_id = identity, token = %token, "Connection admitted");
        Admission {
            identity,
            token,
            closed,
        }
    }

    async fn take_over(&self, key: &str, stale: ConnectionRecord) {
        let notice = TakeoverNotice {
            identity: stale.identity,
            stale_token: stale.token,
            origin_process: self.process_id,
            reason: TakeoverReason::NewConnection,
        };

        info!(
            player_id = stale.identity,
            stale_token = %stale.token,
            owner = %stale.process_id,
            "Taking over existing connection"
        );

        if let Err(e) = self.bus.publish(notice).await {
            // The stale connection lingers until the inactivity sweep
            warn!(player_id = stale.identity, error = %e, "Failed to publish takeover notice");
        }
        if stale.process_id == self.process_id {
            self.close_local(stale.token, CloseReason::Replaced);
        }
        if let Err(e) = self.store.delete(key).await {
            warn!(player_id = stale.identity, error = %e, "Failed to delete stale connection record");
        }
    }

    /// Bus handler: close the named connection if this process owns it.
    /// Repeated notices are no-ops.
    pub fn handle_notice(&self, notice: &TakeoverNotice) -> bool {
        let closed = self.close_local(notice.stale_token, CloseReason::Replaced);
        if closed {
            info!(
                player_id = notice.identity,
                token = %notice.stale_token,
                origin = %notice.origin_process,
                "Closed connection on takeover notice"
            );
        } else {
            debug!(token = %notice.stale_token, "Takeover notice for unknown connection");
        }
        closed
    }

    fn close_local(&self, token: Uuid, reason: CloseReason) -> bool {
        let Some((_, conn)) = self.local.remove(&token) else {
            return false;
        };
        self.active.remove_if(&conn.identity, |_, t| *t == token);
        conn.close_tx.send_replace(Some(reason));
        true
    }

    /// Refresh liveness. Called on every inbound message.
    pub fn touch(&self, token: &Uuid) {
        let now = self.now_ms();
        let Some(conn) = self.local.get(token) else {
            return;
        };
        conn.last_seen.store(now, Ordering::Relaxed);

        let last_refresh = conn.last_store_refresh.load(Ordering::Relaxed);
        if now.saturating_sub(last_refresh) < STORE_REFRESH_INTERVAL.as_millis() as u64 {
            return;
        }
        conn.last_store_refresh.store(now, Ordering::Relaxed);

        let Some(record) = conn.record.clone() else {
            return;
        };
        let store = self.store.clone();
        let identity = conn.identity;
        let token = *token;
        spawn_best_effort("refresh_connection_record", async move {
            let key = connection_key(identity);
            // A newer connection may own the record by now; never write over it
            let refreshed = store.refresh_if_matches(&key, &record, CONNECTION_TTL).await?;
            if !refreshed {
                debug!(player_id = identity, token = %token, "Connection record owned elsewhere, not refreshed");
            }
            Ok::<(), StoreError>(())
        });
    }

    /// Forget a closed connection. The side-store record is removed only
    /// if it still names this token.
    pub async fn release(&self, identity: PlayerId, token: Uuid) {
        let lock = self.identity_lock(identity);
        let guard = lock.lock().await;
        self.local.remove(&token);
        self.active.remove_if(&identity, |_, t| *t == token);

        let key = connection_key(identity);
        match self.store.get(&key).await {
            Ok(Some(raw)) => {
                let owned = serde_json::from_str::<ConnectionRecord>(&raw)
                    .map(|r| r.token == token)
                    .unwrap_or(false);
                if owned {
                    if let Err(e) = self.store.delete(&key).await {
                        warn!(player_id = identity, error = %e, "Failed to delete connection record");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(player_id = identity, error = %e, "Side store read failed on release"),
        }
        drop(guard);
        drop(lock);
        // Only the map's own handle left: nobody is waiting on this identity
        self.admission
            .remove_if(&identity, |_, l| Arc::strong_count(l) == 1);
        debug!(player_id = identity, token = %token, "Connection released");
    }

    /// Close every connection idle for longer than the inactivity threshold
    pub async fn sweep_inactive(&self) -> Vec<(PlayerId, Uuid)> {
        let now = self.now_ms();
        let threshold = self.inactivity_timeout.as_millis() as u64;
        let idle: Vec<(PlayerId, Uuid)> = self
            .local
            .iter()
            .filter(|entry| now.saturating_sub(entry.last_seen.load(Ordering::Relaxed)) > threshold)
            .map(|entry| (entry.identity, *entry.key()))
            .collect();

        for &(identity, token) in &idle {
            if self.close_local(token, CloseReason::Inactive) {
                info!(player_id = identity, token = %token, "Closing inactive connection");
            }
            self.release(identity, token).await;
        }
        idle
    }

    /// Subscribe now, then handle takeover notices until the bus closes
    pub fn spawn_bus_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notice) => {
                        manager.handle_notice(&notice);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Takeover listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Reconciliation bus closed");
                        break;
                    }
                }
            }
        })
    }

    /// Periodic inactivity sweep
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let closed = manager.sweep_inactive().await;
                if !closed.is_empty() {
                    info!(count = closed.len(), "Inactivity sweep closed connections");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::bus::{BusError, LocalBus};
    use crate::store::side::MemoryStore;
    use futures::future::BoxFuture;
    use tokio::sync::broadcast;

    const TIMEOUT: Duration = Duration::from_secs(120);

    fn manager(store: &MemoryStore, bus: &LocalBus) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Uuid::new_v4(),
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            TIMEOUT,
        ))
    }

    async fn stored_token(store: &MemoryStore, identity: PlayerId) -> Option<Uuid> {
        store
            .get(&connection_key(identity))
            .await
            .unwrap()
            .map(|raw| serde_json::from_str::<ConnectionRecord>(&raw).unwrap().token)
    }

    #[tokio::test]
    async fn first_connection_is_admitted_immediately() {
        let store = MemoryStore::new();
        let sessions = manager(&store, &LocalBus::new());

        let admission = sessions.admit(7).await;
        assert!(admission.closed.borrow().is_none());
        assert_eq!(stored_token(&store, 7).await, Some(admission.token));
        assert!(store.get(&session_key(7)).await.unwrap().is_some());
        assert_eq!(sessions.active_token(7), Some(admission.token));
    }

    #[tokio::test]
    async fn second_connection_replaces_first() {
        let store = MemoryStore::new();
        let sessions = manager(&store, &LocalBus::new());

        let first = sessions.admit(7).await;
        let second = sessions.admit(7).await;

        assert_eq!(*first.closed.borrow(), Some(CloseReason::Replaced));
        assert!(second.closed.borrow().is_none());
        assert!(!sessions.is_live(&first.token));
        assert!(sessions.is_live(&second.token));
        assert_eq!(sessions.connection_count(), 1);
        assert_eq!(stored_token(&store, 7).await, Some(second.token));
    }

    #[tokio::test]
    async fn takeover_crosses_processes_via_bus() {
        let store = MemoryStore::new();
        let bus = LocalBus::new();
        let process_a = manager(&store, &bus);
        let process_b = manager(&store, &bus);
        let _la = process_a.spawn_bus_listener();
        let _lb = process_b.spawn_bus_listener();

        let mut on_a = process_a.admit(9).await;
        let on_b = process_b.admit(9).await;

        tokio::time::timeout(Duration::from_secs(1), on_a.closed.changed())
            .await
            .expect("stale connection closed")
            .unwrap();
        assert_eq!(*on_a.closed.borrow(), Some(CloseReason::Replaced));
        assert_eq!(process_a.connection_count(), 0);
        assert!(process_b.is_live(&on_b.token));
        assert_eq!(stored_token(&store, 9).await, Some(on_b.token));
    }

    #[tokio::test]
    async fn notices_are_idempotent_and_token_scoped() {
        let store = MemoryStore::new();
        let sessions = manager(&store, &LocalBus::new());
        let first = sessions.admit(3).await;

        let notice = TakeoverNotice {
            identity: 3,
            stale_token: first.token,
            origin_process: Uuid::new_v4(),
            reason: TakeoverReason::NewConnection,
        };
        assert!(sessions.handle_notice(&notice));
        assert!(!sessions.handle_notice(&notice));

        // A late duplicate must not touch a newer connection of the identity
        let second = sessions.admit(3).await;
        assert!(!sessions.handle_notice(&notice));
        assert!(sessions.is_live(&second.token));
    }

    #[tokio::test]
    async fn stale_release_keeps_newer_record() {
        let store = MemoryStore::new();
        let sessions = manager(&store, &LocalBus::new());
        let first = sessions.admit(4).await;
        let second = sessions.admit(4).await;

        sessions.release(4, first.token).await;
        assert_eq!(stored_token(&store, 4).await, Some(second.token));
        assert_eq!(sessions.active_token(4), Some(second.token));

        sessions.release(4, second.token).await;
        assert_eq!(stored_token(&store, 4).await, None);
        assert_eq!(sessions.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_only_idle_connections() {
        let store = MemoryStore::new();
        let sessions = manager(&store, &LocalBus::new());
        let idle = sessions.admit(1).await;
        let busy = sessions.admit(2).await;

        tokio::time::advance(Duration::from_secs(100)).await;
        sessions.touch(&busy.token);
        tokio::time::advance(Duration::from_secs(30)).await;

        let closed = sessions.sweep_inactive().await;
        assert_eq!(closed, vec![(1, idle.token)]);
        assert_eq!(*idle.closed.borrow(), Some(CloseReason::Inactive));
        assert!(sessions.is_live(&busy.token));
        assert_eq!(stored_token(&store, 1).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_never_overwrites_newer_owner() {
        let store = MemoryStore::new();
        let bus = LocalBus::new();
        let process_a = manager(&store, &bus);
        let process_b = manager(&store, &bus);
        let process_c = manager(&store, &bus);
        let _lb = process_b.spawn_bus_listener();

        let on_a = process_a.admit(9).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let mut on_b = process_b.admit(9).await;

        // A sees traffic before it has handled the takeover notice
        process_a.touch(&on_a.token);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stored_token(&store, 9).await, Some(on_b.token));

        let notice = TakeoverNotice {
            identity: 9,
            stale_token: on_a.token,
            origin_process: process_b.process_id(),
            reason: TakeoverReason::NewConnection,
        };
        assert!(process_a.handle_notice(&notice));
        process_a.release(9, on_a.token).await;
        assert_eq!(stored_token(&store, 9).await, Some(on_b.token));

        // A third connection still finds B and takes over from it
        let on_c = process_c.admit(9).await;
        tokio::time::timeout(Duration::from_secs(1), on_b.closed.changed())
            .await
            .expect("b closed")
            .unwrap();
        assert_eq!(*on_b.closed.borrow(), Some(CloseReason::Replaced));
        assert!(!process_b.is_live(&on_b.token));
        assert!(process_c.is_live(&on_c.token));
    }

    #[tokio::test(start_paused = true)]
    async fn own_record_is_refreshed() {
        let store = MemoryStore::new();
        let sessions = manager(&store, &LocalBus::new());
        let admission = sessions.admit(6).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        sessions.touch(&admission.token);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stored_token(&store, 6).await, Some(admission.token));
    }

    #[tokio::test]
    async fn admission_of_one_identity_does_not_wait_on_another() {
        let store = MemoryStore::new();
        let sessions = manager(&store, &LocalBus::new());

        let busy = sessions.identity_lock(1);
        let _held = busy.lock().await;

        let admitted = tokio::time::timeout(Duration::from_secs(1), sessions.admit(2)).await;
        assert!(admitted.is_ok());
    }

    #[tokio::test]
    async fn identity_locks_are_dropped_after_release() {
        let store = MemoryStore::new();
        let sessions = manager(&store, &LocalBus::new());
        let admission = sessions.admit(8).await;
        sessions.release(8, admission.token).await;
        assert!(sessions.admission.is_empty());
    }

    struct BrokenBus;

    impl ReconciliationBus for BrokenBus {
        fn publish(&self, _notice: TakeoverNotice) -> BoxFuture<'_, Result<(), BusError>> {
            Box::pin(async { Err(BusError::Unavailable("down".into())) })
        }

        fn subscribe(&self) -> broadcast::Receiver<TakeoverNotice> {
            broadcast::channel(1).1
        }
    }

    #[tokio::test]
    async fn bus_failure_does_not_block_admission() {
        let store = MemoryStore::new();
        let sessions = SessionManager::new(
            Uuid::new_v4(),
            Arc::new(store.clone()),
            Arc::new(BrokenBus),
            TIMEOUT,
        );
        let first = sessions.admit(5).await;
        let second = sessions.admit(5).await;

        // Local connections are still arbitrated without the bus
        assert_eq!(*first.closed.borrow(), Some(CloseReason::Replaced));
        assert_eq!(stored_token(&store, 5).await, Some(second.token));
    }
}
