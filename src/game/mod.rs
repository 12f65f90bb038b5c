//! Game simulation modules

pub mod broadcaster;
pub mod combat;
pub mod entity;
pub mod physics;
pub mod scoreboard;
pub mod snapshot;
pub mod world;

pub use broadcaster::{MatchError, TickBroadcaster, WorldCommand, WorldHandle};
pub use entity::{EntityState, InputFlags, InputSample, PlayerId};
pub use world::World;
