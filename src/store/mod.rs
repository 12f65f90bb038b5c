//! External collaborators: connection-state side store and match persistence

pub mod postgrest;
pub mod side;
pub mod stats;

pub use postgrest::{PersistenceError, PostgrestClient};
pub use side::{MemoryStore, SideStore, StoreError};
pub use stats::{MatchStore, MemoryMatchStore, PlayerStats, PostgrestMatchStore};
