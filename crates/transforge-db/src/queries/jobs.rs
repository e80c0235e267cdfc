//! Job record operations.
//!
//! Every transition that changes whether a job is active (`queued` or
//! `running`) also adjusts the owner's quota counter in the same
//! `BEGIN IMMEDIATE` transaction. The immediate write lock is what
//! serializes concurrent admissions for the counter.

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use transforge_common::{Error, ErrorCode, JobId, JobStatus, OwnerKey, Result};

use crate::models::{CancelOutcome, Job, NewJob};
use crate::now_timestamp;
use crate::queries::{quotas, webhook_outbox};

const COLS: &str = "id, owner, input_ref, output_ref, params, status, progress,
    error_code, error_summary, webhook_url, max_duration_secs,
    created_at, started_at, finished_at";

fn immediate(conn: &Connection) -> Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| Error::database(e.to_string()))
}

fn commit(tx: Transaction<'_>) -> Result<()> {
    tx.commit().map_err(|e| Error::database(e.to_string()))
}

/// Insert a job after re-checking the owner's quota, then increment it.
///
/// The id only escapes this function once the transaction has committed.
pub fn create_job(conn: &Connection, new: &NewJob, max_active: u32) -> Result<Job> {
    let params = serde_json::to_string(&new.params)
        .map_err(|e| Error::internal(format!("Failed to encode params: {e}")))?;
    let now = now_timestamp();

    let tx = immediate(conn)?;
    quotas::check(&tx, &new.owner, max_active)?;

    tx.execute(
        "INSERT INTO jobs (owner, input_ref, params, status, progress, webhook_url,
                           max_duration_secs, created_at)
         VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?6)",
        rusqlite::params![
            new.owner.as_str(),
            &new.input_ref,
            params,
            new.webhook_url.as_deref(),
            new.max_duration_secs as i64,
            &now
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    let id = JobId::from_row(tx.last_insert_rowid());

    quotas::increment(&tx, &new.owner)?;
    commit(tx)?;

    Ok(Job {
        id,
        owner: new.owner.clone(),
        input_ref: new.input_ref.clone(),
        output_ref: None,
        params: new.params.clone(),
        status: JobStatus::Queued,
        progress: 0,
        error_code: None,
        error_summary: None,
        webhook_url: new.webhook_url.clone(),
        max_duration_secs: new.max_duration_secs,
        created_at: now,
        started_at: None,
        finished_at: None,
    })
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE id = ?1");
    conn.query_row(&q, [id.get()], Job::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// List the most recent jobs, optionally restricted to one owner and/or status.
pub fn list_jobs(
    conn: &Connection,
    owner: Option<&OwnerKey>,
    status: Option<JobStatus>,
    limit: u32,
) -> Result<Vec<Job>> {
    let q = format!(
        "SELECT {COLS} FROM jobs
         WHERE (?1 IS NULL OR owner = ?1) AND (?2 IS NULL OR status = ?2)
         ORDER BY id DESC LIMIT ?3"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map(
            rusqlite::params![
                owner.map(OwnerKey::as_str),
                status.map(JobStatus::as_str),
                limit as i64
            ],
            Job::from_row,
        )
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Remove a job that never left `queued`, releasing its quota slot.
///
/// Used to compensate when the queue refuses the job after the row was
/// committed. Returns true if a row was deleted.
pub fn delete_queued_job(conn: &Connection, id: JobId) -> Result<bool> {
    let tx = immediate(conn)?;
    let owner: Option<String> = tx
        .query_row(
            "DELETE FROM jobs WHERE id = ?1 AND status = 'queued' RETURNING owner",
            [id.get()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;
    if let Some(owner) = &owner {
        quotas::release(&tx, owner)?;
    }
    commit(tx)?;
    Ok(owner.is_some())
}

/// Move a job from `queued` to `running`. Returns false if the job is
/// missing or no longer queued (for example, cancelled before pickup).
pub fn start_job(conn: &Connection, id: JobId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'queued'",
            rusqlite::params![now_timestamp(), id.get()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Record progress for a running job. The stored value never decreases.
pub fn update_progress(conn: &Connection, id: JobId, progress: u8) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET progress = MAX(progress, ?1)
             WHERE id = ?2 AND status = 'running'",
            rusqlite::params![progress.min(100) as i64, id.get()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark a running job as completed with its output reference, staging its
/// webhook delivery in the same transaction.
///
/// Returns false if the job is no longer running (it was cancelled while
/// the output was uploading).
pub fn complete_job(conn: &Connection, id: JobId, output_ref: &str) -> Result<bool> {
    let tx = immediate(conn)?;
    let owner: Option<String> = tx
        .query_row(
            "UPDATE jobs SET status = 'completed', progress = 100, output_ref = ?1,
                finished_at = ?2
             WHERE id = ?3 AND status = 'running'
             RETURNING owner",
            rusqlite::params![output_ref, now_timestamp(), id.get()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;
    if let Some(owner) = &owner {
        quotas::release(&tx, owner)?;
        webhook_outbox::stage(&tx, id)?;
    }
    commit(tx)?;
    Ok(owner.is_some())
}

/// Mark a running job as failed with a sanitized code and summary, staging
/// its webhook delivery in the same transaction.
pub fn fail_job(conn: &Connection, id: JobId, code: ErrorCode, summary: &str) -> Result<bool> {
    let tx = immediate(conn)?;
    let owner: Option<String> = tx
        .query_row(
            "UPDATE jobs SET status = 'failed', error_code = ?1, error_summary = ?2,
                finished_at = ?3
             WHERE id = ?4 AND status = 'running'
             RETURNING owner",
            rusqlite::params![code.as_str(), summary, now_timestamp(), id.get()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;
    if let Some(owner) = &owner {
        quotas::release(&tx, owner)?;
        webhook_outbox::stage(&tx, id)?;
    }
    commit(tx)?;
    Ok(owner.is_some())
}

/// Cancel a queued or running job. Cancelling a terminal job is a no-op.
pub fn cancel_job(conn: &Connection, id: JobId) -> Result<CancelOutcome> {
    let tx = immediate(conn)?;
    let current: Option<(String, String)> = tx
        .query_row(
            "SELECT status, owner FROM jobs WHERE id = ?1",
            [id.get()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;
    let Some((status, owner)) = current else {
        return Err(Error::not_found("job", id));
    };
    let status: JobStatus = status.parse().map_err(Error::database)?;

    if status.is_terminal() {
        return Ok(CancelOutcome::AlreadyTerminal(status));
    }

    tx.execute(
        "UPDATE jobs SET status = 'cancelled', finished_at = ?1 WHERE id = ?2",
        rusqlite::params![now_timestamp(), id.get()],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    quotas::release(&tx, &owner)?;
    commit(tx)?;

    Ok(CancelOutcome::Cancelled { previous: status })
}

/// Fail every job left `running` by a previous process and stage their
/// webhook deliveries.
///
/// Returns the ids that were moved. Quota counters are not touched; callers
/// rebuild them with [`quotas::recompute_all`] afterwards.
pub fn fail_interrupted_jobs(conn: &Connection, summary: &str) -> Result<Vec<JobId>> {
    let tx = immediate(conn)?;
    let ids = {
        let mut stmt = tx
            .prepare(
                "UPDATE jobs SET status = 'failed', error_code = ?1, error_summary = ?2,
                    finished_at = ?3
                 WHERE status = 'running'
                 RETURNING id",
            )
            .map_err(|e| Error::database(e.to_string()))?;
        let moved = stmt
            .query_map(
                rusqlite::params![ErrorCode::Interrupted.as_str(), summary, now_timestamp()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| Error::database(e.to_string()))?
            .map(|r| r.map(JobId::from_row))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::database(e.to_string()))?;
        moved
    };
    for id in &ids {
        webhook_outbox::stage(&tx, *id)?;
    }
    commit(tx)?;
    Ok(ids)
}

/// Delete terminal jobs that finished before `cutoff` (an RFC 3339
/// timestamp as produced by [`crate::format_timestamp`]). Their webhook
/// attempts go with them. Returns the number of jobs deleted.
pub fn prune_finished_before(conn: &Connection, cutoff: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM jobs
         WHERE status IN ('completed', 'failed', 'cancelled')
           AND finished_at IS NOT NULL AND finished_at < ?1",
        [cutoff],
    )
    .map_err(|e| Error::database(e.to_string()))
}
