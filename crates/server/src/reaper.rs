//! Background task that reclaims batches from crashed or hung workers.

use std::sync::Arc;
use std::time::Duration;

use crate::state::ServerState;

pub const REAP_TICK: Duration = Duration::from_secs(2);

/// Periodically returns every working batch whose dispatch version has
/// fallen more than `max_patience` state ticks behind to the free queue.
/// Patience is measured in model-state versions, so reclamation tempo
/// follows training tempo rather than wall-clock.
pub async fn run(state: Arc<ServerState>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let reaped = state.core.lock().reap_stale();
        if reaped > 0 {
            tracing::debug!(reaped, "returned expired working batches to free");
            state.notify.notify_waiters();
        }
    }
}
