//! Async facade over the job queries.
//!
//! rusqlite is blocking, so every call runs on tokio's blocking pool. A
//! slow disk or a writer waiting on the `BEGIN IMMEDIATE` lock therefore
//! never holds up the runtime threads that serve requests and drive
//! transcodes.

use rusqlite::Connection;
use transforge_common::{Error, ErrorCode, JobId, JobStatus, OwnerKey, Result};
use transforge_db::models::{AttemptOutcome, CancelOutcome, Job, NewJob, OutboxState, WebhookAttempt};
use transforge_db::pool::{get_conn, DbPool};
use transforge_db::queries::{jobs, quotas, task_queue, webhook_attempts, webhook_outbox};

#[derive(Clone)]
pub struct JobStore {
    db: DbPool,
}

impl JobStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &DbPool {
        &self.db
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = get_conn(&db)?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("spawn_blocking join error: {e}")))?
    }

    /// Persist a new job, charging it to the owner's quota.
    pub async fn create(&self, new: NewJob, max_active: u32) -> Result<Job> {
        self.with_conn(move |conn| jobs::create_job(conn, &new, max_active))
            .await
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.with_conn(move |conn| jobs::get_job(conn, id)).await
    }

    /// Like [`JobStore::get`], but a missing job is an error.
    pub async fn require(&self, id: JobId) -> Result<Job> {
        self.get(id).await?.ok_or_else(|| Error::not_found("job", id))
    }

    pub async fn list(
        &self,
        owner: Option<OwnerKey>,
        status: Option<JobStatus>,
        limit: u32,
    ) -> Result<Vec<Job>> {
        self.with_conn(move |conn| jobs::list_jobs(conn, owner.as_ref(), status, limit))
            .await
    }

    pub async fn delete_queued(&self, id: JobId) -> Result<bool> {
        self.with_conn(move |conn| jobs::delete_queued_job(conn, id))
            .await
    }

    pub async fn start(&self, id: JobId) -> Result<bool> {
        self.with_conn(move |conn| jobs::start_job(conn, id)).await
    }

    pub async fn update_progress(&self, id: JobId, progress: u8) -> Result<bool> {
        self.with_conn(move |conn| jobs::update_progress(conn, id, progress))
            .await
    }

    pub async fn complete(&self, id: JobId, output_ref: String) -> Result<bool> {
        self.with_conn(move |conn| jobs::complete_job(conn, id, &output_ref))
            .await
    }

    pub async fn fail(&self, id: JobId, code: ErrorCode, summary: String) -> Result<bool> {
        self.with_conn(move |conn| jobs::fail_job(conn, id, code, &summary))
            .await
    }

    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        self.with_conn(move |conn| jobs::cancel_job(conn, id)).await
    }

    pub async fn active_count(&self, owner: OwnerKey) -> Result<u32> {
        self.with_conn(move |conn| quotas::active_count(conn, &owner))
            .await
    }

    pub async fn record_attempt(
        &self,
        job_id: JobId,
        url: String,
        attempt: u32,
        scheduled_at: String,
    ) -> Result<i64> {
        self.with_conn(move |conn| {
            webhook_attempts::record_attempt(conn, job_id, &url, attempt, &scheduled_at)
        })
        .await
    }

    pub async fn finish_attempt(
        &self,
        attempt_id: i64,
        outcome: AttemptOutcome,
        http_status: Option<u16>,
    ) -> Result<bool> {
        self.with_conn(move |conn| {
            webhook_attempts::finish_attempt(conn, attempt_id, outcome, http_status)
        })
        .await
    }

    pub async fn attempts(&self, job_id: JobId) -> Result<Vec<WebhookAttempt>> {
        self.with_conn(move |conn| webhook_attempts::list_for_job(conn, job_id))
            .await
    }

    /// Attempt number a delivery for `job_id` continues from.
    pub async fn next_attempt(&self, job_id: JobId) -> Result<u32> {
        self.with_conn(move |conn| webhook_attempts::next_attempt(conn, job_id))
            .await
    }

    /// Jobs whose webhook delivery has not been settled.
    pub async fn pending_deliveries(&self) -> Result<Vec<JobId>> {
        self.with_conn(webhook_outbox::pending).await
    }

    /// Record the final state of a job's webhook delivery.
    pub async fn settle_delivery(&self, job_id: JobId, state: OutboxState) -> Result<bool> {
        self.with_conn(move |conn| webhook_outbox::settle(conn, job_id, state))
            .await
    }

    pub async fn delivery_state(&self, job_id: JobId) -> Result<Option<OutboxState>> {
        self.with_conn(move |conn| webhook_outbox::state(conn, job_id))
            .await
    }

    /// Repair state left behind by a process that stopped mid-flight.
    ///
    /// Running jobs are failed as interrupted (they are never re-run) and
    /// their webhook deliveries staged, queue entries of finished jobs are dropped, and the quota counters
    /// are rebuilt from the job rows. Returns the ids of the failed jobs and
    /// of the queued jobs that have no queue entry and need re-enqueueing.
    pub async fn recover(&self) -> Result<Recovery> {
        self.with_conn(|conn| {
            let interrupted =
                jobs::fail_interrupted_jobs(conn, "the worker running this job stopped")?;
            let dropped_entries = task_queue::remove_finished(conn)?;
            quotas::recompute_all(conn)?;
            let orphaned = task_queue::orphaned_queued_jobs(conn)?;
            Ok(Recovery {
                interrupted,
                dropped_entries,
                orphaned,
            })
        })
        .await
    }

    /// Delete terminal jobs finished before `cutoff`.
    pub async fn prune(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let cutoff = transforge_db::format_timestamp(cutoff);
        self.with_conn(move |conn| jobs::prune_finished_before(conn, &cutoff))
            .await
    }
}

/// What [`JobStore::recover`] found.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    pub interrupted: Vec<JobId>,
    pub dropped_entries: usize,
    pub orphaned: Vec<JobId>,
}
