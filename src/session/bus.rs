//! Reconciliation bus: cross-process takeover notices
//!
//! Delivery is at-least-once. Handlers key on the stale connection token,
//! never on identity alone, so a late notice cannot close a newer connection.

use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::game::entity::PlayerId;

/// Buffered notices per subscriber before it starts lagging
const LOCAL_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeoverReason {
    /// Same identity opened a newer connection
    NewConnection,
}

/// Instruction to close one specific stale connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverNotice {
    pub identity: PlayerId,
    pub stale_token: Uuid,
    pub origin_process: Uuid,
    pub reason: TakeoverReason,
}

/// Bus errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

pub trait ReconciliationBus: Send + Sync {
    fn publish(&self, notice: TakeoverNotice) -> BoxFuture<'_, Result<(), BusError>>;

    /// Subscribe to every notice published after this call
    fn subscribe(&self) -> broadcast::Receiver<TakeoverNotice>;
}

/// In-process bus. Processes sharing one instance see each other's notices.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<TakeoverNotice>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationBus for LocalBus {
    fn publish(&self, notice: TakeoverNotice) -> BoxFuture<'_, Result<(), BusError>> {
        // Publishing with no subscribers is not an error for pub/sub
        let _ = self.tx.send(notice);
        Box::pin(future::ready(Ok(())))
    }

    fn subscribe(&self) -> broadcast::Receiver<TakeoverNotice> {
        self.tx.subscribe()
    }
}
