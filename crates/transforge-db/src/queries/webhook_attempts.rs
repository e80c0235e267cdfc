//! Webhook delivery ledger.

use rusqlite::Connection;
use transforge_common::{Error, JobId, Result};

use crate::models::{AttemptOutcome, WebhookAttempt};
use crate::now_timestamp;

const COLS: &str = "id, job_id, url, attempt, scheduled_at, outcome, http_status, finished_at";

/// Record that attempt number `attempt` for `job_id` is about to be made.
///
/// Attempt numbers are unique per job; recording the same number twice
/// fails.
pub fn record_attempt(
    conn: &Connection,
    job_id: JobId,
    url: &str,
    attempt: u32,
    scheduled_at: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO webhook_attempts (job_id, url, attempt, scheduled_at, outcome)
         VALUES (?1, ?2, ?3, ?4, 'pending')",
        rusqlite::params![job_id.get(), url, attempt, scheduled_at],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(conn.last_insert_rowid())
}

/// Store the outcome of a recorded attempt.
pub fn finish_attempt(
    conn: &Connection,
    id: i64,
    outcome: AttemptOutcome,
    http_status: Option<u16>,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE webhook_attempts SET outcome = ?1, http_status = ?2, finished_at = ?3
             WHERE id = ?4",
            rusqlite::params![outcome.as_str(), http_status, now_timestamp(), id],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Number the next attempt for `job_id` continues from: one past the highest
/// recorded, so a delivery resumed after a restart never reuses a number.
pub fn next_attempt(conn: &Connection, job_id: JobId) -> Result<u32> {
    let last: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(attempt), 0) FROM webhook_attempts WHERE job_id = ?1",
            [job_id.get()],
            |row| row.get(0),
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(u32::try_from(last).unwrap_or(0).saturating_add(1))
}

/// All attempts for a job, in attempt order.
pub fn list_for_job(conn: &Connection, job_id: JobId) -> Result<Vec<WebhookAttempt>> {
    let q = format!("SELECT {COLS} FROM webhook_attempts WHERE job_id = ?1 ORDER BY attempt ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([job_id.get()], WebhookAttempt::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}
