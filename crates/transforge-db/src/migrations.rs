//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order. A
//! `schema_migrations` table tracks which versions have been applied.

use rusqlite::Connection;
use transforge_common::{Error, Result};

/// V1: jobs, per-owner quota counters, the task queue and the webhook ledger.
const V1_INITIAL: &str = r#"
CREATE TABLE jobs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    owner             TEXT NOT NULL,
    input_ref         TEXT NOT NULL,
    output_ref        TEXT,
    params            TEXT NOT NULL DEFAULT '{}',
    status            TEXT NOT NULL DEFAULT 'queued'
                      CHECK (status IN ('queued', 'running', 'completed', 'failed', 'cancelled')),
    progress          INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
    error_code        TEXT,
    error_summary     TEXT,
    webhook_url       TEXT,
    max_duration_secs INTEGER NOT NULL,
    created_at        TEXT NOT NULL,
    started_at        TEXT,
    finished_at       TEXT
);
CREATE INDEX idx_jobs_owner_created ON jobs(owner, created_at);
CREATE INDEX idx_jobs_status ON jobs(status);

-- Count of queued + running jobs per owner, maintained in the same
-- transactions that create and finish jobs.
CREATE TABLE owner_quotas (
    owner  TEXT PRIMARY KEY,
    active INTEGER NOT NULL DEFAULT 0 CHECK (active >= 0)
);

CREATE TABLE task_queue (
    job_id       INTEGER PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
    enqueued_at  TEXT NOT NULL,
    leased_until INTEGER,
    receipt      TEXT,
    deliveries   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_task_queue_lease ON task_queue(leased_until);

CREATE TABLE webhook_attempts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id       INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    url          TEXT NOT NULL,
    attempt      INTEGER NOT NULL,
    scheduled_at TEXT NOT NULL,
    outcome      TEXT NOT NULL DEFAULT 'pending',
    http_status  INTEGER,
    finished_at  TEXT,
    UNIQUE (job_id, attempt)
);
"#;

/// V2: durable webhook outbox. A row is staged in the same transaction that
/// makes a job completed or failed, and only leaves `pending` once the
/// delivery is settled, so an unsettled delivery survives restarts.
const V2_WEBHOOK_OUTBOX: &str = r#"
CREATE TABLE webhook_outbox (
    job_id     INTEGER PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
    url        TEXT NOT NULL,
    state      TEXT NOT NULL DEFAULT 'pending'
               CHECK (state IN ('pending', 'delivered', 'abandoned')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX idx_webhook_outbox_state ON webhook_outbox(state, created_at);
"#;

/// Ordered list of (version, sql) pairs.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL), (2, V2_WEBHOOK_OUTBOX)];

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies each outstanding migration inside a transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
    }

    Ok(())
}
