//! Fixed-size pool of workers pulling jobs from the broker.
//!
//! Each worker is one tokio task that runs one job at a time to its end
//! before asking for the next, so the transcodes in flight never exceed
//! the pool size. The transcoder itself is a child process and database
//! calls go through the blocking pool, so a busy worker never stalls the
//! others.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transforge_common::{JobStatus, Result};

use super::{ExecutionOutcome, TaskExecutor};
use crate::config::Config;
use crate::jobs::{CancellationRegistry, JobStore};
use crate::queue::{Broker, Delivery};
use crate::webhook::WebhookDispatcher;

#[derive(Debug, Clone)]
pub struct WorkerPoolSettings {
    pub count: usize,
    /// Wait between polls when the queue is empty.
    pub poll_interval: Duration,
}

impl WorkerPoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            count: config.workers.count,
            poll_interval: Duration::from_millis(config.workers.poll_interval_ms),
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    store: JobStore,
    broker: Arc<dyn Broker>,
    executor: TaskExecutor,
    registry: CancellationRegistry,
    dispatcher: WebhookDispatcher,
    settings: WorkerPoolSettings,
}

impl WorkerPool {
    pub fn new(
        store: JobStore,
        broker: Arc<dyn Broker>,
        executor: TaskExecutor,
        registry: CancellationRegistry,
        dispatcher: WebhookDispatcher,
        settings: WorkerPoolSettings,
    ) -> Self {
        Self {
            store,
            broker,
            executor,
            registry,
            dispatcher,
            settings,
        }
    }

    /// Start the workers. They stop once `shutdown` fires; a job running at
    /// that moment is stopped and recorded as interrupted.
    pub fn spawn(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.settings.count)
            .map(|slot| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(slot, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(self, slot: usize, shutdown: CancellationToken) {
        tracing::info!(worker = slot, "Worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once(&shutdown).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!(worker = slot, "Worker error: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        tracing::info!(worker = slot, "Worker stopped");
    }

    /// Take one delivery from the broker and process it.
    ///
    /// Returns `Ok(false)` when the queue was empty.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<bool> {
        let Some(delivery) = self.broker.dequeue().await? else {
            return Ok(false);
        };
        self.process_delivery(&delivery, shutdown).await?;
        Ok(true)
    }

    /// Run the job behind a delivery, if it still wants running.
    ///
    /// Deliveries can be duplicated or outlive their job, so anything that is
    /// not a `queued` job is acknowledged and skipped.
    pub async fn process_delivery(
        &self,
        delivery: &Delivery,
        shutdown: &CancellationToken,
    ) -> Result<Option<ExecutionOutcome>> {
        let job_id = delivery.job_id;
        let job = match self.store.get(job_id).await? {
            Some(job) if job.status == JobStatus::Queued => job,
            Some(job) => {
                tracing::debug!(job_id = %job_id, status = %job.status, "Skipping delivery of job that is not queued");
                self.broker.ack(delivery).await?;
                return Ok(None);
            }
            None => {
                tracing::debug!(job_id = %job_id, "Skipping delivery of deleted job");
                self.broker.ack(delivery).await?;
                return Ok(None);
            }
        };

        // Registered before the start transition so a cancel that lands right
        // after it always finds the token.
        let running = self.registry.register(job_id, shutdown);
        if !self.store.start(job_id).await? {
            tracing::debug!(job_id = %job_id, "Job left the queued state before it started");
            self.broker.ack(delivery).await?;
            return Ok(None);
        }
        if delivery.deliveries > 1 {
            tracing::info!(job_id = %job_id, deliveries = delivery.deliveries, "Job redelivered after an expired lease");
        }

        let outcome = self.executor.execute(&job, running.token()).await;
        drop(running);

        if let Err(e) = self.broker.ack(delivery).await {
            // The job row is terminal, so a redelivery is skipped above.
            tracing::warn!(job_id = %job_id, "Failed to ack finished job: {e}");
        }

        if matches!(
            outcome,
            ExecutionOutcome::Completed { .. } | ExecutionOutcome::Failed { .. }
        ) {
            match self.store.get(job_id).await {
                Ok(Some(finished)) => self.dispatcher.dispatch(&finished),
                Ok(None) => {}
                Err(e) => tracing::warn!(job_id = %job_id, "Failed to load job for notification: {e}"),
            }
        }

        Ok(Some(outcome))
    }
}
