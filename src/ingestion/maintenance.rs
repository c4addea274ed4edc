//! Periodic housekeeping: pruning settled sessions and sweeping scratch
//! files left behind by uploads that never finished.

use super::progress::ProgressTracker;
use super::store::AssetStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub prune_interval: Duration,
    /// Minimum age of a scratch entry before it is considered orphaned.
    /// Keeps the sweep from racing uploads that are still streaming.
    pub orphan_grace: Duration,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            prune_interval: Duration::from_secs(300),
            orphan_grace: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned_sessions: usize,
    pub removed_orphans: usize,
}

/// One maintenance pass.
pub async fn run_maintenance(
    tracker: &ProgressTracker,
    store: &AssetStore,
    orphan_grace: Duration,
) -> MaintenanceReport {
    let pruned_sessions = tracker.prune(chrono::Utc::now().timestamp_millis());

    let removed_orphans = match store.scratch().sweep(orphan_grace).await {
        Ok(count) => count,
        Err(e) => {
            error!("Failed to sweep {:?}: {}", store.scratch().dir(), e);
            0
        }
    };

    MaintenanceReport {
        pruned_sessions,
        removed_orphans,
    }
}

/// Spawn the maintenance loop. It stops when `shutdown` is cancelled.
pub fn spawn_maintenance(
    tracker: Arc<ProgressTracker>,
    store: Arc<AssetStore>,
    settings: MaintenanceSettings,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    info!(
        "Session pruning every {}s, orphan grace {}s",
        settings.prune_interval.as_secs(),
        settings.orphan_grace.as_secs()
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.prune_interval.max(Duration::from_secs(1)));
        // Skip the first immediate tick, wait for the first interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Maintenance loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = run_maintenance(&tracker, &store, settings.orphan_grace).await;
                    if report.pruned_sessions > 0 || report.removed_orphans > 0 {
                        info!(
                            "Pruned {} sessions, removed {} orphaned scratch entries",
                            report.pruned_sessions, report.removed_orphans
                        );
                    }
                }
            }
        }
    })
}
