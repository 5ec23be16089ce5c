//! Background health loop for the session pool.

use crate::pool::SessionPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Spawn the periodic pool scan. The loop runs serially with itself: a tick
/// that fires while a scan is still running is delayed, never overlapped.
/// On shutdown the in-flight scan completes before the task exits.
pub fn spawn_health_loop(
    pool: Arc<SessionPool>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup state settles
        ticker.tick().await;

        info!(interval_secs = interval.as_secs(), "Session health loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = pool.run_health_check().await {
                        error!(error = %e, "Session health check failed");
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Session health loop stopped");
                        break;
                    }
                }
            }
        }
    })
}
