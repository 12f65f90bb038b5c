//! Fire-and-forget helpers for collaborator calls

use std::fmt::Display;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::warn;

/// Spawn a collaborator call whose failure must never reach the caller.
///
/// Errors are logged under `operation` and dropped; the in-memory state
/// stays authoritative regardless of the outcome.
pub fn spawn_best_effort<F, E>(operation: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            warn!(operation, error = %e, "Best-effort collaborator call failed");
        }
    })
}
