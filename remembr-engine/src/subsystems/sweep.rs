//! Window TTL sweeper
//!
//! Expiry is enforced lazily on every window access; this loop only reclaims
//! windows nobody touches again, plus their idle session leases.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::{interval, Duration};

use crate::subsystems::window::ShortTermWindow;

pub async fn run_window_sweeper(
    window: Arc<ShortTermWindow>,
    interval_seconds: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    if interval_seconds == 0 {
        tracing::info!("Window sweeper disabled via config");
        return;
    }

    let mut ticker = interval(Duration::from_secs(interval_seconds));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(interval_secs = interval_seconds, backend = window.backend_name(), "Window sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                tracing::info!("Window sweeper stopping");
                return;
            }
        }

        match window.sweep_expired().await {
            Ok(stats) => {
                if stats.windows_removed > 0 || stats.entries_expired > 0 {
                    tracing::info!(
                        windows_removed = stats.windows_removed,
                        entries_expired = stats.entries_expired,
                        leases_pruned = stats.leases_pruned,
                        "Window sweep complete"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Window sweep failed"),
        }
    }
}
