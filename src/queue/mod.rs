//! Broker collaborator.
//!
//! Workers pull job ids from a [`Broker`]. A dequeued [`Delivery`] stays
//! invisible to other workers until it is acknowledged or its lease runs
//! out, after which it is handed out again. The executor therefore treats
//! every delivery as possibly duplicated and checks the job row before
//! doing any work.

mod sqlite;

pub use sqlite::SqliteBroker;

use async_trait::async_trait;
use transforge_common::{JobId, Result};

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    /// Opaque token proving this worker holds the lease.
    pub receipt: String,
    /// Times this entry has been handed out, including this one.
    pub deliveries: u32,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Make a job available to workers.
    async fn enqueue(&self, job_id: JobId) -> Result<()>;

    /// Take the next available job, if any.
    async fn dequeue(&self) -> Result<Option<Delivery>>;

    /// Remove a delivered job from the queue for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Whether the job currently has a queue entry.
    async fn contains(&self, job_id: JobId) -> Result<bool>;
}
