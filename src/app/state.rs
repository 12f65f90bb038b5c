//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::{TickBroadcaster, World, WorldHandle};
use crate::session::{ReconciliationBus, SessionManager};
use crate::store::{MatchStore, MemoryMatchStore, PostgrestClient, PostgrestMatchStore, SideStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub world: WorldHandle,
    pub side_store: Arc<dyn SideStore>,
    pub match_store: Arc<dyn MatchStore>,
}

impl AppState {
    /// Wire the state around the given collaborators. The returned
    /// broadcaster must be spawned for the world to advance.
    pub fn new(
        config: Config,
        side_store: Arc<dyn SideStore>,
        bus: Arc<dyn ReconciliationBus>,
        match_store: Arc<dyn MatchStore>,
    ) -> (Self, TickBroadcaster) {
        let config = Arc::new(config);

        let sessions = Arc::new(SessionManager::new(
            config.process_id,
            side_store.clone(),
            bus,
            config.inactivity_timeout,
        ));

        let world = World::new(config.motion, config.combat_rules());
        let (broadcaster, handle) = TickBroadcaster::new(
            world,
            side_store.clone(),
            match_store.clone(),
            config.tick_rate_hz,
        );

        let state = Self {
            config,
            sessions,
            world: handle,
            side_store,
            match_store,
        };
        (state, broadcaster)
    }
}

/// Match store for the configured persistence backend
pub fn match_store_for(config: &Config) -> Arc<dyn MatchStore> {
    match &config.persistence {
        Some(persistence) => {
            let client = PostgrestClient::new(&persistence.url, &persistence.service_key);
            Arc::new(PostgrestMatchStore::new(client))
        }
        None => Arc::new(MemoryMatchStore::new()),
    }
}
