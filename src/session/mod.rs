//! Connection registry and cross-process reconciliation

pub mod bus;
pub mod registry;

pub use bus::{BusError, LocalBus, ReconciliationBus, TakeoverNotice, TakeoverReason};
pub use registry::{Admission, CloseReason, ConnectionRecord, SessionManager};
