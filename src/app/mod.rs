//! Application wiring

mod state;

pub use state::{match_store_for, AppState};
