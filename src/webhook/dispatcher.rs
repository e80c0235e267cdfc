//! At-least-once webhook delivery.
//!
//! One delivery walks `Pending -> Attempting -> (Delivered | Retrying |
//! Abandoned)`, looping through `Retrying` until the budget runs out. Every
//! attempt re-resolves and re-checks the target, then connects only to the
//! addresses it just checked, so a DNS answer that changed since admission
//! (or changes between check and connect) cannot steer the request inward.
//!
//! The job's outbox row is staged when the job finishes and settled here
//! once the delivery is delivered or abandoned. A delivery that shutdown
//! interrupts ends `Suspended` with its row still pending, and
//! [`WebhookDispatcher::resume_pending`] picks it up on the next start.
//! The job row itself is never touched.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use transforge_common::{Error, JobId, Result, ValidationError};
use transforge_db::models::{AttemptOutcome, Job, OutboxState};

use super::{RetryPolicy, WebhookPayload};
use crate::config::Config;
use crate::jobs::JobStore;
use crate::validate::url::{validate_webhook_url, ResolvedTarget, WebhookPolicy};
use crate::validate::webhook_policy;

/// Header carrying the body signature when a signing secret is configured.
pub const SIGNATURE_HEADER: &str = "X-Transforge-Signature";

type HmacSha256 = Hmac<Sha256>;

/// `sha256=<hex HMAC-SHA256 of body>`.
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Where a delivery is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Delivered { attempts: u32 },
    Abandoned { attempts: u32 },
    /// Stopped by shutdown; left pending for the next start.
    Suspended { attempts: u32 },
}

impl DeliveryState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered { .. }
                | DeliveryState::Abandoned { .. }
                | DeliveryState::Suspended { .. }
        )
    }
}

/// Summary of a finished delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// `Delivered`, `Abandoned` or `Suspended`.
    pub state: DeliveryState,
    /// Number of the last attempt made, counting attempts made before a
    /// restart.
    pub attempts: u32,
    /// Wait before each retry, in order.
    pub delays: Vec<Duration>,
}

/// Result of a single attempt.
#[derive(Debug)]
enum AttemptResult {
    Delivered(u16),
    /// Worth retrying: timeouts, connection errors, 408, 429 and 5xx.
    Transient(Option<u16>),
    /// Retrying cannot help: the target is forbidden or answered 4xx.
    Permanent(Option<u16>),
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub policy: WebhookPolicy,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub signing_secret: Option<String>,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: webhook_policy(config),
            retry: RetryPolicy::from_config(&config.webhook),
            request_timeout: Duration::from_secs(config.webhook.request_timeout_secs),
            signing_secret: config.webhook.signing_secret.clone(),
        }
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    store: JobStore,
    settings: Arc<DispatcherSettings>,
    shutdown: CancellationToken,
}

impl WebhookDispatcher {
    pub fn new(store: JobStore, settings: DispatcherSettings, shutdown: CancellationToken) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
            shutdown,
        }
    }

    /// Deliver the outcome of a finished job in the background, if it has a
    /// webhook and its state is announced.
    pub fn dispatch(&self, job: &Job) {
        let Some(target) = job.webhook_url.clone() else {
            return;
        };
        let Some(payload) = WebhookPayload::from_job(job) else {
            return;
        };
        let dispatcher = self.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            dispatcher.deliver(job_id, &payload, &target).await;
        });
    }

    /// Restart every delivery a previous process left unsettled. Returns
    /// how many were restarted.
    pub async fn resume_pending(&self) -> Result<usize> {
        let mut resumed = 0;
        for job_id in self.store.pending_deliveries().await? {
            let job = self.store.get(job_id).await?;
            let announced = job
                .as_ref()
                .filter(|job| job.webhook_url.is_some())
                .and_then(WebhookPayload::from_job);
            match (job, announced) {
                (Some(job), Some(_)) => {
                    tracing::info!(job_id = %job_id, status = %job.status, "Resuming webhook delivery");
                    self.dispatch(&job);
                    resumed += 1;
                }
                _ => {
                    tracing::warn!(job_id = %job_id, "Pending webhook delivery has nothing to announce, abandoning");
                    self.store
                        .settle_delivery(job_id, OutboxState::Abandoned)
                        .await?;
                }
            }
        }
        Ok(resumed)
    }

    /// Deliver `payload` to `target`, retrying with backoff.
    ///
    /// Attempt numbers continue from the ledger, so a resumed delivery only
    /// gets the attempts its budget has left (and always at least one).
    pub async fn deliver(
        &self,
        job_id: JobId,
        payload: &WebhookPayload,
        target: &str,
    ) -> DeliveryReport {
        let retry = &self.settings.retry;
        let first = match self.store.next_attempt(job_id).await {
            Ok(first) => first,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "Failed to read webhook ledger: {e}");
                1
            }
        };
        let mut state = DeliveryState::Pending;
        let mut delays = Vec::new();
        let mut attempts = first - 1;

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(job_id = %job_id, "Failed to encode webhook payload: {e}");
                let state = DeliveryState::Abandoned { attempts };
                self.settle(job_id, state).await;
                return DeliveryReport {
                    state,
                    attempts,
                    delays,
                };
            }
        };

        while !state.is_final() {
            state = match state {
                DeliveryState::Pending if self.shutdown.is_cancelled() => {
                    tracing::info!(job_id = %job_id, "Webhook delivery deferred to the next start");
                    DeliveryState::Suspended { attempts }
                }
                DeliveryState::Pending => DeliveryState::Attempting { attempt: first },

                DeliveryState::Retrying { attempt, delay } => {
                    delays.push(delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => DeliveryState::Attempting { attempt },
                        _ = self.shutdown.cancelled() => {
                            tracing::info!(job_id = %job_id, attempt, "Webhook delivery suspended at shutdown");
                            DeliveryState::Suspended { attempts }
                        }
                    }
                }

                DeliveryState::Attempting { attempt } => {
                    attempts = attempt;
                    let ledger_id = self.open_ledger_entry(job_id, target, attempt).await;
                    let result = self.attempt(job_id, target, &body).await;
                    self.close_ledger_entry(ledger_id, &result).await;

                    match result {
                        AttemptResult::Delivered(status) => {
                            tracing::info!(job_id = %job_id, attempt, status, "Webhook delivered");
                            DeliveryState::Delivered { attempts: attempt }
                        }
                        AttemptResult::Transient(status) if attempt < retry.max_attempts => {
                            let delay = retry.delay_for(attempt, &mut rand::thread_rng());
                            tracing::warn!(
                                job_id = %job_id,
                                attempt,
                                status,
                                delay_ms = delay.as_millis() as u64,
                                "Webhook attempt failed, retrying"
                            );
                            DeliveryState::Retrying {
                                attempt: attempt + 1,
                                delay,
                            }
                        }
                        AttemptResult::Transient(_) => {
                            let err = Error::DeliveryExhausted {
                                job_id: job_id.to_string(),
                                attempts: attempt,
                            };
                            tracing::error!(job_id = %job_id, "{err}");
                            DeliveryState::Abandoned { attempts: attempt }
                        }
                        AttemptResult::Permanent(status) => {
                            tracing::error!(job_id = %job_id, attempt, status, "Webhook rejected, giving up");
                            DeliveryState::Abandoned { attempts: attempt }
                        }
                    }
                }

                final_state => final_state,
            };
        }

        self.settle(job_id, state).await;
        DeliveryReport {
            state,
            attempts,
            delays,
        }
    }

    /// Settle the outbox row of a delivered or abandoned job. A suspended
    /// delivery stays pending.
    async fn settle(&self, job_id: JobId, state: DeliveryState) {
        let outbox = match state {
            DeliveryState::Delivered { .. } => OutboxState::Delivered,
            DeliveryState::Abandoned { .. } => OutboxState::Abandoned,
            _ => return,
        };
        if let Err(e) = self.store.settle_delivery(job_id, outbox).await {
            tracing::warn!(job_id = %job_id, "Failed to settle webhook delivery: {e}");
        }
    }

    async fn attempt(&self, job_id: JobId, target: &str, body: &[u8]) -> AttemptResult {
        let resolved = match validate_webhook_url(target, &self.settings.policy).await {
            Ok(resolved) => resolved,
            Err(e @ ValidationError::ForbiddenWebhookTarget(_)) => {
                tracing::warn!(job_id = %job_id, "Webhook target failed re-validation: {e}");
                return AttemptResult::Permanent(None);
            }
            Err(e) => {
                // Resolution failures may clear up later.
                tracing::warn!(job_id = %job_id, "Webhook target could not be checked: {e}");
                return AttemptResult::Transient(None);
            }
        };

        let client = match self.pinned_client(&resolved) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(job_id = %job_id, "Failed to build webhook client: {e}");
                return AttemptResult::Transient(None);
            }
        };

        let mut request = client
            .post(resolved.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some(secret) = &self.settings.signing_secret {
            if let Some(signature) = sign_body(secret, body) {
                request = request.header(SIGNATURE_HEADER, signature);
            }
        }

        match request.send().await {
            Ok(response) => classify(response.status()),
            Err(e) => {
                tracing::debug!(job_id = %job_id, "Webhook request failed: {e}");
                AttemptResult::Transient(None)
            }
        }
    }

    /// A client that connects only to the checked addresses and never
    /// follows redirects.
    fn pinned_client(&self, target: &ResolvedTarget) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.settings.request_timeout)
            .no_proxy();
        if target.host.parse::<std::net::IpAddr>().is_err() {
            builder = builder.resolve_to_addrs(&target.host, &target.addrs);
        }
        builder.build()
    }

    async fn open_ledger_entry(&self, job_id: JobId, target: &str, attempt: u32) -> Option<i64> {
        match self
            .store
            .record_attempt(
                job_id,
                target.to_string(),
                attempt,
                transforge_db::now_timestamp(),
            )
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(job_id = %job_id, attempt, "Failed to record webhook attempt: {e}");
                None
            }
        }
    }

    async fn close_ledger_entry(&self, ledger_id: Option<i64>, result: &AttemptResult) {
        let Some(id) = ledger_id else {
            return;
        };
        let (outcome, status) = match *result {
            AttemptResult::Delivered(status) => (AttemptOutcome::Delivered, Some(status)),
            AttemptResult::Transient(status) => (AttemptOutcome::Failed, status),
            AttemptResult::Permanent(None) => (AttemptOutcome::Rejected, None),
            AttemptResult::Permanent(status) => (AttemptOutcome::Failed, status),
        };
        if let Err(e) = self.store.finish_attempt(id, outcome, status).await {
            tracing::warn!(attempt_id = id, "Failed to finish webhook attempt record: {e}");
        }
    }
}

fn classify(status: reqwest::StatusCode) -> AttemptResult {
    let code = status.as_u16();
    if status.is_success() {
        AttemptResult::Delivered(code)
    } else if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        AttemptResult::Transient(Some(code))
    } else {
        AttemptResult::Permanent(Some(code))
    }
}
