//! Webhook delivery against a mock endpoint: retries, ledger, target
//! re-validation and signing.

mod common;

use std::time::Duration;

use common::TestHarness;
use tokio_util::sync::CancellationToken;
use transforge::validate::WebhookPolicy;
use transforge::webhook::{
    sign_body, DeliveryState, DispatcherSettings, RetryPolicy, WebhookDispatcher, WebhookPayload,
    SIGNATURE_HEADER,
};
use transforge_common::{JobId, JobStatus, OwnerKey, TransformParams};
use transforge_db::models::{NewJob, OutboxState};
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(max_attempts: u32, trusted: bool) -> DispatcherSettings {
    DispatcherSettings {
        policy: WebhookPolicy {
            allow_http: true,
            trusted_hosts: if trusted {
                vec!["127.0.0.1".to_string()]
            } else {
                Vec::new()
            },
        },
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            jitter_ratio: 0.2,
        },
        request_timeout: Duration::from_secs(5),
        signing_secret: None,
    }
}

async fn finished_job(harness: &TestHarness) -> JobId {
    finished_job_notifying(harness, None).await
}

async fn finished_job_notifying(harness: &TestHarness, webhook_url: Option<String>) -> JobId {
    let store = &harness.services.store;
    let job = store
        .create(
            NewJob {
                owner: OwnerKey::new("studio-a").unwrap(),
                input_ref: "a.mov".into(),
                params: TransformParams::default(),
                webhook_url,
                max_duration_secs: 60,
            },
            10,
        )
        .await
        .unwrap();
    store.start(job.id).await.unwrap();
    store
        .complete(job.id, format!("outputs/job-{}/a.mp4", job.id))
        .await
        .unwrap();
    job.id
}

fn payload(job_id: JobId) -> WebhookPayload {
    WebhookPayload {
        job_id,
        status: JobStatus::Completed,
        error_code: None,
        output_ref: Some(format!("outputs/job-{job_id}/a.mp4")),
        finished_at: Some("2026-01-01T00:00:00Z".into()),
    }
}

#[tokio::test]
async fn retries_until_delivered_with_growing_delays() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    let job_id = finished_job(&harness).await;
    let dispatcher = WebhookDispatcher::new(
        harness.services.store.clone(),
        settings(5, true),
        CancellationToken::new(),
    );

    let report = dispatcher
        .deliver(job_id, &payload(job_id), &format!("{}/hook", server.uri()))
        .await;

    assert_eq!(report.state, DeliveryState::Delivered { attempts: 4 });
    assert_eq!(report.attempts, 4);
    assert_eq!(report.delays.len(), 3);
    assert!(
        report.delays.windows(2).all(|w| w[0] < w[1]),
        "delays did not grow: {:?}",
        report.delays
    );
    assert!(report.delays[0] >= Duration::from_millis(20));
    assert_eq!(server.received_requests().await.unwrap().len(), 4);

    let ledger = harness.services.store.attempts(job_id).await.unwrap();
    let outcomes: Vec<_> = ledger.iter().map(|a| a.outcome.as_str()).collect();
    assert_eq!(outcomes, ["failed", "failed", "failed", "delivered"]);
    let numbers: Vec<_> = ledger.iter().map(|a| a.attempt).collect();
    assert_eq!(numbers, [1, 2, 3, 4]);
    assert_eq!(ledger[0].http_status, Some(500));
    assert_eq!(ledger[3].http_status, Some(200));

    // The job row is untouched by delivery.
    assert_eq!(harness.job(job_id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn gives_up_after_the_attempt_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    let job_id = finished_job(&harness).await;
    let dispatcher = WebhookDispatcher::new(
        harness.services.store.clone(),
        settings(3, true),
        CancellationToken::new(),
    );

    let report = dispatcher
        .deliver(job_id, &payload(job_id), &server.uri())
        .await;

    assert_eq!(report.state, DeliveryState::Abandoned { attempts: 3 });
    assert_eq!(report.delays.len(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    let ledger = harness.services.store.attempts(job_id).await.unwrap();
    assert_eq!(ledger.len(), 3);
    assert!(ledger.iter().all(|a| a.outcome == "failed" && a.finished_at.is_some()));
    assert_eq!(harness.job(job_id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    let job_id = finished_job(&harness).await;
    let dispatcher = WebhookDispatcher::new(
        harness.services.store.clone(),
        settings(5, true),
        CancellationToken::new(),
    );

    let report = dispatcher
        .deliver(job_id, &payload(job_id), &server.uri())
        .await;

    assert_eq!(report.state, DeliveryState::Abandoned { attempts: 1 });
    assert!(report.delays.is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn internal_target_is_rejected_at_delivery_time() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    let job_id = finished_job(&harness).await;
    // Loopback is not trusted here, as if the target had been re-pointed
    // after admission.
    let dispatcher = WebhookDispatcher::new(
        harness.services.store.clone(),
        settings(5, false),
        CancellationToken::new(),
    );
    let target = format!("http://127.0.0.1:{}/admin", server.address().port());

    let report = dispatcher.deliver(job_id, &payload(job_id), &target).await;

    assert_eq!(report.state, DeliveryState::Abandoned { attempts: 1 });
    assert!(server.received_requests().await.unwrap().is_empty());
    let ledger = harness.services.store.attempts(job_id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].outcome, "rejected");
    assert_eq!(ledger[0].http_status, None);
}

#[tokio::test]
async fn redirects_are_not_followed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(
            ResponseTemplate::new(307).insert_header("Location", "http://169.254.169.254/latest"),
        )
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    let job_id = finished_job(&harness).await;
    let dispatcher = WebhookDispatcher::new(
        harness.services.store.clone(),
        settings(3, true),
        CancellationToken::new(),
    );

    let report = dispatcher
        .deliver(job_id, &payload(job_id), &format!("{}/hook", server.uri()))
        .await;

    assert_eq!(report.state, DeliveryState::Abandoned { attempts: 1 });
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn signed_when_a_secret_is_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists(SIGNATURE_HEADER))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    let job_id = finished_job(&harness).await;
    let mut settings = settings(1, true);
    settings.signing_secret = Some("shared-secret".into());
    let dispatcher =
        WebhookDispatcher::new(harness.services.store.clone(), settings, CancellationToken::new());

    let report = dispatcher
        .deliver(job_id, &payload(job_id), &server.uri())
        .await;
    assert_eq!(report.state, DeliveryState::Delivered { attempts: 1 });

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let signature = request
        .headers
        .get(SIGNATURE_HEADER)
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(
        Some(signature.to_string()),
        sign_body("shared-secret", &request.body)
    );
    assert_eq!(
        request.headers.get("content-type").unwrap().to_str().unwrap(),
        "application/json"
    );
}

#[tokio::test]
async fn shutdown_stops_pending_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    let job_id = finished_job(&harness).await;
    let mut settings = settings(5, true);
    settings.retry.base_delay = Duration::from_secs(30);
    settings.retry.max_delay = Duration::from_secs(60);
    let shutdown = CancellationToken::new();
    let dispatcher = WebhookDispatcher::new(harness.services.store.clone(), settings, shutdown.clone());

    let target = server.uri();
    let job_payload = payload(job_id);
    let run = tokio::spawn(async move { dispatcher.deliver(job_id, &job_payload, &target).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.received_requests().await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "first attempt never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("delivery did not stop")
        .unwrap();
    assert_eq!(report.state, DeliveryState::Suspended { attempts: 1 });
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn suspended_delivery_resumes_where_it_stopped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    let target = format!("{}/hook", server.uri());
    let job_id = finished_job_notifying(&harness, Some(target.clone())).await;
    let store = harness.services.store.clone();
    assert_eq!(store.pending_deliveries().await.unwrap(), vec![job_id]);

    let mut slow = settings(5, true);
    slow.retry.base_delay = Duration::from_secs(30);
    slow.retry.max_delay = Duration::from_secs(60);
    let shutdown = CancellationToken::new();
    let dispatcher = WebhookDispatcher::new(store.clone(), slow, shutdown.clone());
    let job = harness.job(job_id).await;
    let job_payload = WebhookPayload::from_job(&job).unwrap();
    let run = tokio::spawn(async move { dispatcher.deliver(job_id, &job_payload, &target).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.received_requests().await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "first attempt never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    let report = run.await.unwrap();
    assert_eq!(report.state, DeliveryState::Suspended { attempts: 1 });
    assert_eq!(
        store.delivery_state(job_id).await.unwrap(),
        Some(OutboxState::Pending)
    );

    // Next start.
    let dispatcher = WebhookDispatcher::new(store.clone(), settings(5, true), CancellationToken::new());
    assert_eq!(dispatcher.resume_pending().await.unwrap(), 1);
    harness.wait_for_delivery(job_id, OutboxState::Delivered).await;

    let numbers: Vec<_> = store
        .attempts(job_id)
        .await
        .unwrap()
        .iter()
        .map(|a| (a.attempt, a.http_status))
        .collect();
    assert_eq!(numbers, [(1, Some(503)), (2, Some(200))]);
    assert!(store.pending_deliveries().await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_delivery_is_not_resumed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    let target = server.uri();
    let job_id = finished_job_notifying(&harness, Some(target.clone())).await;
    let store = harness.services.store.clone();
    let dispatcher = WebhookDispatcher::new(store.clone(), settings(2, true), CancellationToken::new());

    let report = dispatcher.deliver(job_id, &payload(job_id), &target).await;
    assert_eq!(report.state, DeliveryState::Abandoned { attempts: 2 });
    assert_eq!(
        store.delivery_state(job_id).await.unwrap(),
        Some(OutboxState::Abandoned)
    );
    assert_eq!(dispatcher.resume_pending().await.unwrap(), 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
