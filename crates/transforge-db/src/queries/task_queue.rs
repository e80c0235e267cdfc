//! Durable task queue backing the SQLite broker.
//!
//! A row exists for every job handed to the workers and is removed when a
//! worker acknowledges it. Claiming a row stamps it with a lease deadline
//! (milliseconds since the Unix epoch) and a random receipt; until the
//! lease lapses no other worker can claim it, and only the holder of the
//! receipt can acknowledge it.

use rusqlite::{Connection, OptionalExtension};
use transforge_common::{Error, JobId, Result};
use uuid::Uuid;

use crate::now_timestamp;

/// A claimed queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub job_id: JobId,
    pub receipt: String,
    /// How many times this entry has been claimed, including this one.
    pub deliveries: u32,
}

/// Add a job to the queue. Enqueueing a job twice is a no-op.
pub fn enqueue(conn: &Connection, job_id: JobId) -> Result<()> {
    conn.execute(
        "INSERT INTO task_queue (job_id, enqueued_at) VALUES (?1, ?2)
         ON CONFLICT(job_id) DO NOTHING",
        rusqlite::params![job_id.get(), now_timestamp()],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Claim the oldest entry whose lease is free or expired.
pub fn claim_next(conn: &Connection, now_ms: i64, lease_ms: i64) -> Result<Option<Claim>> {
    let receipt = Uuid::new_v4().to_string();
    conn.query_row(
        "UPDATE task_queue
         SET leased_until = ?1, receipt = ?2, deliveries = deliveries + 1
         WHERE job_id = (
             SELECT job_id FROM task_queue
             WHERE leased_until IS NULL OR leased_until <= ?3
             ORDER BY job_id ASC LIMIT 1
         )
         RETURNING job_id, deliveries",
        rusqlite::params![now_ms + lease_ms, &receipt, now_ms],
        |row| {
            let deliveries: i64 = row.get(1)?;
            Ok(Claim {
                job_id: JobId::from_row(row.get(0)?),
                receipt: receipt.clone(),
                deliveries: deliveries.max(0) as u32,
            })
        },
    )
    .optional()
    .map_err(|e| Error::database(e.to_string()))
}

/// Remove a claimed entry. Returns false if the receipt no longer matches
/// (the lease expired and another worker claimed it).
pub fn ack(conn: &Connection, job_id: JobId, receipt: &str) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM task_queue WHERE job_id = ?1 AND receipt = ?2",
            rusqlite::params![job_id.get(), receipt],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Remove an entry regardless of lease.
pub fn remove(conn: &Connection, job_id: JobId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM task_queue WHERE job_id = ?1", [job_id.get()])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Whether the job has a queue entry.
pub fn contains(conn: &Connection, job_id: JobId) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM task_queue WHERE job_id = ?1",
        [job_id.get()],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Number of entries in the queue.
pub fn len(conn: &Connection) -> Result<u64> {
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM task_queue", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n.max(0) as u64)
}

/// Drop entries whose job is no longer queued or running.
pub fn remove_finished(conn: &Connection) -> Result<usize> {
    conn.execute(
        "DELETE FROM task_queue WHERE job_id IN (
             SELECT id FROM jobs WHERE status NOT IN ('queued', 'running')
         )",
        [],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Queued jobs that have no queue entry.
pub fn orphaned_queued_jobs(conn: &Connection) -> Result<Vec<JobId>> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM jobs
             WHERE status = 'queued'
               AND id NOT IN (SELECT job_id FROM task_queue)
             ORDER BY id ASC",
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
