//! Job admission.
//!
//! One request moves through `validated -> reserved -> persisted ->
//! enqueued`. Reservation and persistence happen in the same store
//! transaction, so the only stage that can fail after a row exists is the
//! hand-off to the broker; that failure deletes the row again (which also
//! returns the quota slot) before the error reaches the caller.

use std::sync::Arc;

use transforge_common::{Error, OwnerKey, Result};
use transforge_db::models::{Job, NewJob};

use super::store::JobStore;
use crate::queue::Broker;
use crate::validate::{JobRequest, Validator};

#[derive(Clone)]
pub struct AdmissionService {
    validator: Validator,
    store: JobStore,
    broker: Arc<dyn Broker>,
    max_active_per_owner: u32,
}

impl AdmissionService {
    pub fn new(
        validator: Validator,
        store: JobStore,
        broker: Arc<dyn Broker>,
        max_active_per_owner: u32,
    ) -> Self {
        Self {
            validator,
            store,
            broker,
            max_active_per_owner,
        }
    }

    /// Admit a request for `owner`.
    ///
    /// On success the returned job is durably stored and queued. On failure
    /// nothing is left behind.
    pub async fn admit(&self, owner: OwnerKey, request: JobRequest) -> Result<Job> {
        let validated = self.validator.validate(&request).await?;

        let new = NewJob {
            owner: owner.clone(),
            input_ref: validated.input_ref,
            params: validated.params,
            webhook_url: validated.webhook.map(|t| t.url.to_string()),
            max_duration_secs: validated.max_duration_secs,
        };

        let job = self.store.create(new, self.max_active_per_owner).await?;

        if let Err(e) = self.broker.enqueue(job.id).await {
            tracing::error!(job_id = %job.id, owner = %owner, error = %e, "Enqueue failed, rolling back job");
            match self.store.delete_queued(job.id).await {
                Ok(_) => {}
                Err(rollback) => {
                    // Startup recovery re-enqueues queued rows without an entry.
                    tracing::error!(job_id = %job.id, error = %rollback, "Rollback of unqueued job failed");
                }
            }
            return Err(Error::broker("job could not be queued, try again later"));
        }

        tracing::info!(
            job_id = %job.id,
            owner = %owner,
            input = %job.input_ref,
            "Job admitted"
        );
        Ok(job)
    }
}
