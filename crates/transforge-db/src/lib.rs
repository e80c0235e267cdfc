//! transforge-db: database access and persistence layer.
//!
//! SQLite-backed storage with connection pooling, embedded migrations,
//! typed row models and query modules for jobs, per-owner quota counters,
//! the task queue, the webhook outbox and the webhook attempt ledger.
//!
//! Every query is a free function over `&rusqlite::Connection`; callers in
//! async code run them on the blocking pool.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

/// Current time in the fixed-width RFC 3339 form stored in every timestamp
/// column, so that text comparison matches chronological order.
pub fn now_timestamp() -> String {
    format_timestamp(chrono::Utc::now())
}

/// Format a timestamp the way the store persists it.
pub fn format_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
