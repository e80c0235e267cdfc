use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use transforge_common::{Error, JobId, Result};
use transforge_db::pool::{get_conn, DbPool};
use transforge_db::queries::task_queue;

use super::{Broker, Delivery};

/// Broker backed by the `task_queue` table of the job database.
#[derive(Clone)]
pub struct SqliteBroker {
    db: DbPool,
    lease: Duration,
}

impl SqliteBroker {
    /// `lease` should exceed the longest a job may run, so a healthy worker
    /// never loses its entry mid-job.
    pub fn new(db: DbPool, lease: Duration) -> Self {
        Self { db, lease }
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
        .map_err(|e| match e {
            Error::Database(msg) => Error::broker(msg),
            other => other,
        })
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn enqueue(&self, job_id: JobId) -> Result<()> {
        self.with_conn(move |conn| task_queue::enqueue(conn, job_id))
            .await
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX / 2);
        let claim = self
            .with_conn(move |conn| task_queue::claim_next(conn, now_ms(), lease_ms))
            .await?;
        Ok(claim.map(|c| Delivery {
            job_id: c.job_id,
            receipt: c.receipt,
            deliveries: c.deliveries,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let job_id = delivery.job_id;
        let receipt = delivery.receipt.clone();
        let acked = self
            .with_conn(move |conn| task_queue::ack(conn, job_id, &receipt))
            .await?;
        if !acked {
            tracing::warn!(job_id = %job_id, "Queue entry was already released or re-leased");
        }
        Ok(())
    }

    async fn contains(&self, job_id: JobId) -> Result<bool> {
        self.with_conn(move |conn| task_queue::contains(conn, job_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transforge_common::{OwnerKey, TransformParams};
    use transforge_db::models::NewJob;
    use transforge_db::pool::init_pool;
    use transforge_db::queries::jobs;

    #[tokio::test]
    async fn enqueue_dequeue_ack() {
        let dir = tempfile::tempdir().unwrap();
        let db = init_pool(dir.path().join("q.db").to_str().unwrap(), 2).unwrap();
        let job_id = {
            let conn = get_conn(&db).unwrap();
            let new = NewJob {
                owner: OwnerKey::new("acme").unwrap(),
                input_ref: "in.mov".into(),
                params: TransformParams::default(),
                webhook_url: None,
                max_duration_secs: 60,
            };
            jobs::create_job(&conn, &new, 10).unwrap().id
        };

        let broker = SqliteBroker::new(db, Duration::from_secs(60));
        broker.enqueue(job_id).await.unwrap();
        assert!(broker.contains(job_id).await.unwrap());

        let delivery = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(delivery.job_id, job_id);
        assert!(broker.dequeue().await.unwrap().is_none());

        broker.ack(&delivery).await.unwrap();
        assert!(!broker.contains(job_id).await.unwrap());
    }

    #[tokio::test]
    async fn enqueue_unknown_job_is_broker_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = init_pool(dir.path().join("q.db").to_str().unwrap(), 2).unwrap();
        let broker = SqliteBroker::new(db, Duration::from_secs(60));
        let err = broker.enqueue(JobId::from_row(77)).await.unwrap_err();
        assert!(matches!(err, Error::Broker(_)));
    }
}
