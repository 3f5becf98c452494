//! Background session cleanup task.
//!
//! Periodically evicts expired federation sessions from the store.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::store::SessionStore;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// Spawn a background task that periodically cleans up expired sessions.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_cleanup_task(
    session_store: Arc<SessionStore>,
    cleanup_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep(&session_store);
        }
    })
}

/// Run one eviction pass. Returns the number of evicted sessions.
pub fn sweep(session_store: &SessionStore) -> usize {
    let evicted = match session_store.evict_expired() {
        Ok(count) => {
            if count > 0 {
                info!(evicted = count, "Session cleanup completed");
            } else {
                debug!("Session cleanup: no expired sessions");
            }
            count
        }
        Err(e) => {
            warn!(error = %e, "Session cleanup failed");
            0
        }
    };

    match session_store.session_count() {
        Ok(count) => debug!(active_sessions = count, "Session store status"),
        Err(e) => debug!(error = %e, "Failed to get session count"),
    }

    evicted
}
