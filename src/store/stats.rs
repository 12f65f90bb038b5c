//! Match results and rankings (persistence collaborator)
//!
//! Called only at match boundaries, on death events and from the periodic
//! ranking job; never from the per-tick path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::entity::PlayerId;

use super::postgrest::{PersistenceError, PostgrestClient};

/// Per-player totals for one match (or globally, for rankings)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlayerStats {
    pub player_id: PlayerId,
    pub kills: u32,
    pub deaths: u32,
    pub score: u32,
}

pub trait MatchStore: Send + Sync {
    fn create_match(
        &self,
        match_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), PersistenceError>>;

    fn end_match(
        &self,
        match_id: Uuid,
        ended_at: DateTime<Utc>,
        standings: Vec<PlayerStats>,
    ) -> BoxFuture<'_, Result<(), PersistenceError>>;

    /// Killer +1 kill and `score`, victim +1 death
    fn record_kill(
        &self,
        match_id: Uuid,
        killer: PlayerId,
        victim: PlayerId,
        score: u32,
    ) -> BoxFuture<'_, Result<(), PersistenceError>>;

    /// Recompute the global ranking aggregate
    fn refresh_rankings(&self) -> BoxFuture<'_, Result<(), PersistenceError>>;
}

/// Match store backed by PostgREST tables and stored procedures
#[derive(Clone)]
pub struct PostgrestMatchStore {
    client: PostgrestClient,
}

#[derive(Serialize)]
struct NewMatch {
    id: Uuid,
    started_at: DateTime<Utc>,
    status: &'static str,
}

#[derive(Serialize)]
struct MatchEnd {
    ended_at: DateTime<Utc>,
    status: &'static str,
}

impl PostgrestMatchStore {
    pub fn new(client: PostgrestClient) -> Self {
        Self { client }
    }
}

impl MatchStore for PostgrestMatchStore {
    fn create_match(
        &self,
        match_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            let row = NewMatch {
                id: match_id,
                started_at,
                status: "active",
            };
            self.client.insert("matches", &row).await
        })
    }

    fn end_match(
        &self,
        match_id: Uuid,
        ended_at: DateTime<Utc>,
        standings: Vec<PlayerStats>,
    ) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            let filter = format!("id=eq.{}", match_id);
            let patch = MatchEnd {
                ended_at,
                status: "ended",
            };
            self.client.update("matches", &filter, &patch).await?;
            self.client
                .rpc(
                    "record_match_results",
                    &json!({ "p_match_id": match_id, "p_standings": standings }),
                )
                .await
        })
    }

    fn record_kill(
        &self,
        match_id: Uuid,
        killer: PlayerId,
        victim: PlayerId,
        score: u32,
    ) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            self.client
                .rpc(
                    "record_kill",
                    &json!({
                        "p_match_id": match_id,
                        "p_killer_id": killer,
                        "p_victim_id": victim,
                        "p_score": score,
                    }),
                )
                .await
        })
    }

    fn refresh_rankings(&self) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move { self.client.rpc("refresh_rankings", &json!({})).await })
    }
}

/// Recorded persistence call, kept by `MemoryMatchStore`
#[derive(Debug, Clone, PartialEq)]
pub enum StatsEvent {
    Created(Uuid),
    Ended {
        match_id: Uuid,
        standings: Vec<PlayerStats>,
    },
    Kill {
        match_id: Uuid,
        killer: PlayerId,
        victim: PlayerId,
        score: u32,
    },
}

#[derive(Default)]
struct MemoryStats {
    events: Vec<StatsEvent>,
    rankings: Vec<PlayerStats>,
}

/// In-process match store used when no database is configured
#[derive(Clone, Default)]
pub struct MemoryMatchStore {
    inner: Arc<Mutex<MemoryStats>>,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatsEvent> {
        self.inner.lock().events.clone()
    }

    /// Global ranking as of the last refresh, best score first
    pub fn rankings(&self) -> Vec<PlayerStats> {
        self.inner.lock().rankings.clone()
    }

    fn push(&self, event: StatsEvent) {
        debug!(?event, "Recording match stats");
        self.inner.lock().events.push(event);
    }
}

impl MatchStore for MemoryMatchStore {
    fn create_match(
        &self,
        match_id: Uuid,
        _started_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), PersistenceError>> {
        self.push(StatsEvent::Created(match_id));
        Box::pin(futures::future::ready(Ok(())))
    }

    fn end_match(
        &self,
        match_id: Uuid,
        _ended_at: DateTime<Utc>,
        standings: Vec<PlayerStats>,
    ) -> BoxFuture<'_, Result<(), PersistenceError>> {
        self.push(StatsEvent::Ended {
            match_id,
            standings,
        });
        Box::pin(futures::future::ready(Ok(())))
    }

    fn record_kill(
        &self,
        match_id: Uuid,
        killer: PlayerId,
        victim: PlayerId,
        score: u32,
    ) -> BoxFuture<'_, Result<(), PersistenceError>> {
        self.push(StatsEvent::Kill {
            match_id,
            killer,
            victim,
            score,
        });
        Box::pin(futures::future::ready(Ok(())))
    }

    fn refresh_rankings(&self) -> BoxFuture<'_, Result<(), PersistenceError>> {
        let mut inner = self.inner.lock();
        let mut totals: HashMap<PlayerId, PlayerStats> = HashMap::new();
        for event in &inner.events {
            if let StatsEvent::Kill {
                killer,
                victim,
                score,
                ..
            } = event
            {
                let k = totals.entry(*killer).or_insert_with(|| PlayerStats {
                    player_id: *killer,
                    ..Default::default()
                });
                k.kills += 1;
                k.score += score;
                let v = totals.entry(*victim).or_insert_with(|| PlayerStats {
                    player_id: *victim,
                    ..Default::default()
                });
                v.deaths += 1;
            }
        }
        let mut rankings: Vec<PlayerStats> = totals.into_values().collect();
        rankings.sort_by(|a, b| b.score.cmp(&a.score).then(a.player_id.cmp(&b.player_id)));
        inner.rankings = rankings;
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// Periodic ranking aggregation. Failures are logged and retried next period.
pub async fn run_ranking_job(store: Arc<dyn MatchStore>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; rankings are fresh enough at boot
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match store.refresh_rankings().await {
            Ok(()) => info!("Rankings refreshed"),
            Err(e) => warn!(error = %e, "Ranking refresh failed"),
        }
    }
}
