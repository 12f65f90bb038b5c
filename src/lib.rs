//! Dogfight Server - authoritative real-time sync core
//!
//! - Binary snapshot/input codec and JSON control messages
//! - Connection registry with cross-process takeover
//! - Fixed-rate tick broadcaster owning the world
//! - Combat validation with cooldowns, health and respawn
//! - Client-side prediction, reconciliation and interpolation

pub mod app;
pub mod client;
pub mod config;
pub mod game;
pub mod http;
pub mod session;
pub mod store;
pub mod util;
pub mod ws;
