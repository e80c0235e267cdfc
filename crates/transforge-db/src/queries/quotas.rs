//! Per-owner active job counters.
//!
//! The counter for an owner equals the number of its jobs in `queued` or
//! `running`. It is only ever changed inside the transaction that changes
//! the corresponding job row, so callers must pass the transaction's
//! connection.

use rusqlite::{Connection, OptionalExtension};
use transforge_common::{Error, OwnerKey, Result};

/// Current active count for `owner` (0 when no row exists).
pub fn active_count(conn: &Connection, owner: &OwnerKey) -> Result<u32> {
    let n: Option<i64> = conn
        .query_row(
            "SELECT active FROM owner_quotas WHERE owner = ?1",
            [owner.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n.unwrap_or(0).max(0) as u32)
}

/// Fail with [`Error::QuotaExceeded`] when `owner` already has `limit`
/// active jobs.
pub fn check(conn: &Connection, owner: &OwnerKey, limit: u32) -> Result<()> {
    if active_count(conn, owner)? >= limit {
        return Err(Error::QuotaExceeded {
            owner: owner.to_string(),
            limit,
        });
    }
    Ok(())
}

/// Increment the counter for `owner`.
pub fn increment(conn: &Connection, owner: &OwnerKey) -> Result<()> {
    conn.execute(
        "INSERT INTO owner_quotas (owner, active) VALUES (?1, 1)
         ON CONFLICT(owner) DO UPDATE SET active = active + 1",
        [owner.as_str()],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Decrement the counter for `owner`, never below zero.
pub fn release(conn: &Connection, owner: &str) -> Result<()> {
    conn.execute(
        "UPDATE owner_quotas SET active = MAX(active - 1, 0) WHERE owner = ?1",
        [owner],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Rebuild every counter from the job rows.
pub fn recompute_all(conn: &Connection) -> Result<()> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;
    tx.execute_batch(
        "DELETE FROM owner_quotas;
         INSERT INTO owner_quotas (owner, active)
             SELECT owner, COUNT(*) FROM jobs
             WHERE status IN ('queued', 'running')
             GROUP BY owner;",
    )
    .map_err(|e| Error::database(e.to_string()))?;
    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{get_conn, test_pool};

    fn owner(s: &str) -> OwnerKey {
        OwnerKey::new(s).unwrap()
    }

    #[test]
    fn increment_and_release() {
        let (_dir, pool) = test_pool();
        let conn = get_conn(&pool).unwrap();
        let acme = owner("acme");

        assert_eq!(active_count(&conn, &acme).unwrap(), 0);
        increment(&conn, &acme).unwrap();
        increment(&conn, &acme).unwrap();
        assert_eq!(active_count(&conn, &acme).unwrap(), 2);

        release(&conn, "acme").unwrap();
        release(&conn, "acme").unwrap();
        release(&conn, "acme").unwrap();
        assert_eq!(active_count(&conn, &acme).unwrap(), 0);
    }

    #[test]
    fn check_rejects_at_limit() {
        let (_dir, pool) = test_pool();
        let conn = get_conn(&pool).unwrap();
        let acme = owner("acme");

        increment(&conn, &acme).unwrap();
        check(&conn, &acme, 2).unwrap();
        increment(&conn, &acme).unwrap();
        let err = check(&conn, &acme, 2).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { limit: 2, .. }));
    }

    #[test]
    fn recompute_from_rows() {
        let (_dir, pool) = test_pool();
        let conn = get_conn(&pool).unwrap();
        let now = crate::now_timestamp();
        for status in ["queued", "running", "completed", "failed"] {
            conn.execute(
                "INSERT INTO jobs (owner, input_ref, status, max_duration_secs, created_at)
                 VALUES ('acme', 'in.mov', ?1, 60, ?2)",
                rusqlite::params![status, now],
            )
            .unwrap();
        }
        conn.execute(
            "INSERT INTO owner_quotas (owner, active) VALUES ('ghost', 7)",
            [],
        )
        .unwrap();

        recompute_all(&conn).unwrap();
        assert_eq!(active_count(&conn, &owner("acme")).unwrap(), 2);
        assert_eq!(active_count(&conn, &owner("ghost")).unwrap(), 0);
    }
}
