//! Webhook outbox: one row per job whose outcome must be announced.
//!
//! [`stage`] runs inside the transaction that makes a job completed or
//! failed. The row stays `pending` until the dispatcher settles it, so a
//! delivery cut short by a crash or shutdown is found again at startup.

use rusqlite::{Connection, OptionalExtension};
use transforge_common::{Error, JobId, Result};

use crate::models::OutboxState;
use crate::now_timestamp;

/// Stage a pending delivery for `job_id` if the job has a webhook target.
/// Staging twice keeps the first row.
pub fn stage(conn: &Connection, job_id: JobId) -> Result<bool> {
    let now = now_timestamp();
    let n = conn
        .execute(
            "INSERT INTO webhook_outbox (job_id, url, state, created_at, updated_at)
             SELECT id, webhook_url, 'pending', ?2, ?2 FROM jobs
             WHERE id = ?1 AND webhook_url IS NOT NULL
             ON CONFLICT(job_id) DO NOTHING",
            rusqlite::params![job_id.get(), now],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Jobs with an unsettled delivery, oldest first.
pub fn pending(conn: &Connection) -> Result<Vec<JobId>> {
    let mut stmt = conn
        .prepare(
            "SELECT job_id FROM webhook_outbox WHERE state = 'pending'
             ORDER BY created_at ASC, job_id ASC",
        )
        .map_err(|e| Error::database(e.to_string()))?;
    let ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .map_err(|e| Error::database(e.to_string()))?
        .map(|r| r.map(JobId::from_row))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(ids)
}

/// Move a pending delivery to a final state. Returns false if there was no
/// pending delivery for the job.
pub fn settle(conn: &Connection, job_id: JobId, state: OutboxState) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE webhook_outbox SET state = ?1, updated_at = ?2
             WHERE job_id = ?3 AND state = 'pending'",
            rusqlite::params![state.as_str(), now_timestamp(), job_id.get()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

pub fn state(conn: &Connection, job_id: JobId) -> Result<Option<OutboxState>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM webhook_outbox WHERE job_id = ?1",
            [job_id.get()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;
    raw.map(|s| s.parse().map_err(Error::database)).transpose()
}
