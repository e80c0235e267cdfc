//! Rust structs mapping to database tables.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row`.

use rusqlite::types::Type;
use serde::Serialize;
use transforge_common::{ErrorCode, JobId, JobStatus, OwnerKey, TransformParams};

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn parse_text<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

fn parse_opt_text<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    let s: Option<String> = row.get(idx)?;
    s.map(|v| v.parse().map_err(|e| conversion_err(idx, e)))
        .transpose()
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A persisted job row.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub owner: OwnerKey,
    pub input_ref: String,
    pub output_ref: Option<String>,
    pub params: TransformParams,
    pub status: JobStatus,
    pub progress: u8,
    pub error_code: Option<ErrorCode>,
    pub error_summary: Option<String>,
    pub webhook_url: Option<String>,
    pub max_duration_secs: u64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl Job {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let owner: String = row.get(1)?;
        let owner = OwnerKey::new(owner.clone())
            .ok_or_else(|| conversion_err(1, format!("invalid owner key {owner:?}")))?;
        let params: String = row.get(4)?;
        let params = serde_json::from_str(&params).map_err(|e| conversion_err(4, e))?;
        let progress: i64 = row.get(6)?;
        let max_duration: i64 = row.get(10)?;

        Ok(Self {
            id: JobId::from_row(row.get(0)?),
            owner,
            input_ref: row.get(2)?,
            output_ref: row.get(3)?,
            params,
            status: parse_text(row, 5)?,
            progress: progress.clamp(0, 100) as u8,
            error_code: parse_opt_text(row, 7)?,
            error_summary: row.get(8)?,
            webhook_url: row.get(9)?,
            max_duration_secs: max_duration.max(0) as u64,
            created_at: row.get(11)?,
            started_at: row.get(12)?,
            finished_at: row.get(13)?,
        })
    }
}

/// Everything needed to insert a job. The id is assigned by the database.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner: OwnerKey,
    pub input_ref: String,
    pub params: TransformParams,
    pub webhook_url: Option<String>,
    pub max_duration_secs: u64,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job moved to `cancelled` from the given active state.
    Cancelled { previous: JobStatus },
    /// The job was already terminal; nothing changed.
    AlreadyTerminal(JobStatus),
}

// ---------------------------------------------------------------------------
// WebhookAttempt
// ---------------------------------------------------------------------------

/// One row of the webhook delivery ledger.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAttempt {
    pub id: i64,
    pub job_id: JobId,
    pub url: String,
    pub attempt: u32,
    pub scheduled_at: String,
    pub outcome: String,
    pub http_status: Option<u16>,
    pub finished_at: Option<String>,
}

impl WebhookAttempt {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let attempt: i64 = row.get(3)?;
        let status: Option<i64> = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            job_id: JobId::from_row(row.get(1)?),
            url: row.get(2)?,
            attempt: attempt.max(0) as u32,
            scheduled_at: row.get(4)?,
            outcome: row.get(5)?,
            http_status: status.and_then(|s| u16::try_from(s).ok()),
            finished_at: row.get(7)?,
        })
    }
}

/// Ledger outcome of a single webhook attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The endpoint answered with a 2xx status.
    Delivered,
    /// The request failed or the endpoint answered with a non-2xx status.
    Failed,
    /// The target failed re-validation and no request was sent.
    Rejected,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Delivered => "delivered",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Rejected => "rejected",
        }
    }
}

// ---------------------------------------------------------------------------
// WebhookOutbox
// ---------------------------------------------------------------------------

/// Delivery state of a job's webhook notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    /// Not yet settled; resumed after a restart.
    Pending,
    Delivered,
    /// Given up on: retries ran out or the target is refused.
    Abandoned,
}

impl OutboxState {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxState::Pending => "pending",
            OutboxState::Delivered => "delivered",
            OutboxState::Abandoned => "abandoned",
        }
    }
}

impl std::str::FromStr for OutboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxState::Pending),
            "delivered" => Ok(OutboxState::Delivered),
            "abandoned" => Ok(OutboxState::Abandoned),
            other => Err(format!("unknown outbox state '{other}'")),
        }
    }
}
