//! HTTP surface: health, WebSocket upgrade and match control

pub mod routes;

pub use routes::{build_router, AppError};
