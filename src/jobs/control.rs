//! Cancellation of queued and running jobs.
//!
//! Cancelling is advisory. The store transition happens first and is what
//! callers observe; the running executor (if any) is then signalled through
//! its token and stops as soon as it notices.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use transforge_common::{JobId, JobStatus, Result};
use transforge_db::models::CancelOutcome;

use super::store::JobStore;

/// Cancellation tokens of the jobs executing in this process.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<DashMap<JobId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job about to run. The entry is removed when the guard drops.
    pub fn register(&self, job_id: JobId, parent: &CancellationToken) -> RunningJob {
        let token = parent.child_token();
        self.tokens.insert(job_id, token.clone());
        RunningJob {
            job_id,
            token,
            tokens: Arc::clone(&self.tokens),
        }
    }

    /// Signal the executor of `job_id`. Returns false if it is not running here.
    pub fn signal(&self, job_id: JobId) -> bool {
        match self.tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.tokens.contains_key(&job_id)
    }
}

/// Registration of one executing job.
pub struct RunningJob {
    job_id: JobId,
    token: CancellationToken,
    tokens: Arc<DashMap<JobId, CancellationToken>>,
}

impl RunningJob {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        self.tokens.remove(&self.job_id);
    }
}

/// Cancel a job. Cancelling a terminal job is a no-op.
pub async fn cancel_job(
    store: &JobStore,
    registry: &CancellationRegistry,
    job_id: JobId,
) -> Result<CancelOutcome> {
    let outcome = store.cancel(job_id).await?;
    match outcome {
        CancelOutcome::Cancelled { previous } => {
            let signalled = previous == JobStatus::Running && registry.signal(job_id);
            tracing::info!(job_id = %job_id, from = %previous, signalled, "Job cancelled");
        }
        CancelOutcome::AlreadyTerminal(status) => {
            tracing::debug!(job_id = %job_id, status = %status, "Cancel ignored for terminal job");
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_entry() {
        let registry = CancellationRegistry::new();
        let root = CancellationToken::new();
        let id = JobId::from_row(1);

        let running = registry.register(id, &root);
        assert!(registry.is_running(id));
        assert!(registry.signal(id));
        assert!(running.token().is_cancelled());

        drop(running);
        assert!(!registry.is_running(id));
        assert!(!registry.signal(id));
    }

    #[test]
    fn shutdown_reaches_running_jobs() {
        let registry = CancellationRegistry::new();
        let root = CancellationToken::new();
        let running = registry.register(JobId::from_row(2), &root);
        root.cancel();
        assert!(running.token().is_cancelled());
    }
}
