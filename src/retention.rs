//! Removal of old finished jobs.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use transforge_common::Result;

use crate::jobs::JobStore;

/// Delete terminal jobs that finished more than `days` ago. Zero days
/// disables pruning.
pub async fn prune_once(store: &JobStore, days: u32) -> Result<usize> {
    if days == 0 {
        return Ok(0);
    }
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
    let removed = store.prune(cutoff).await?;
    if removed > 0 {
        tracing::info!(removed, days, "Pruned finished jobs");
    }
    Ok(removed)
}

/// Prune every `interval` until `cancel` fires.
pub async fn run_retention(
    store: JobStore,
    days: u32,
    interval: Duration,
    cancel: CancellationToken,
) {
    if days == 0 {
        tracing::info!("Retention disabled");
        return;
    }
    tracing::info!(days, interval_secs = interval.as_secs(), "Retention sweeper started");
    loop {
        if let Err(e) = prune_once(&store, days).await {
            tracing::error!("Retention sweep failed: {e}");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
    }
    tracing::info!("Retention sweeper stopped");
}
