//! Shared utilities

pub mod background;
pub mod rate_limit;
pub mod time;
