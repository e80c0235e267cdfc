//! Startup repair of state left by a previous process.
//!
//! Runs before any worker starts. Jobs that were running are failed as
//! interrupted rather than re-run and their outcome is announced, quota
//! counters are rebuilt from the job rows, and queued jobs whose queue entry
//! was lost are enqueued again. Webhook deliveries left unsettled are
//! restarted and abandoned workspaces are removed.

use std::path::Path;

use transforge_common::Result;

use crate::executor::workspace;
use crate::jobs::JobStore;
use crate::queue::Broker;
use crate::webhook::WebhookDispatcher;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: usize,
    pub dropped_entries: usize,
    pub requeued: usize,
    pub deliveries_resumed: usize,
    pub workspaces_removed: usize,
}

/// `workspace_root` must belong to this instance alone: every job workspace
/// in it is removed.
pub async fn recover(
    store: &JobStore,
    broker: &dyn Broker,
    dispatcher: &WebhookDispatcher,
    workspace_root: &Path,
) -> Result<RecoveryReport> {
    let recovery = store.recover().await?;
    for job_id in &recovery.interrupted {
        tracing::warn!(job_id = %job_id, "Job was running when the previous process stopped, marked interrupted");
    }

    let mut requeued = 0;
    for job_id in &recovery.orphaned {
        broker.enqueue(*job_id).await?;
        tracing::info!(job_id = %job_id, "Re-enqueued queued job without a queue entry");
        requeued += 1;
    }

    // Covers the jobs failed above as well as deliveries cut short earlier.
    let deliveries_resumed = dispatcher.resume_pending().await?;

    let parent = workspace_root.to_path_buf();
    let workspaces_removed = tokio::task::spawn_blocking(move || workspace::sweep_stale(&parent))
        .await
        .map_err(|e| transforge_common::Error::Internal(format!("spawn_blocking join error: {e}")))?;

    let report = RecoveryReport {
        interrupted: recovery.interrupted.len(),
        dropped_entries: recovery.dropped_entries,
        requeued,
        deliveries_resumed,
        workspaces_removed,
    };
    tracing::info!(
        interrupted = report.interrupted,
        dropped_entries = report.dropped_entries,
        requeued = report.requeued,
        deliveries_resumed = report.deliveries_resumed,
        workspaces_removed = report.workspaces_removed,
        "Startup recovery finished"
    );
    Ok(report)
}
