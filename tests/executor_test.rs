//! Transcoder failures: error reporting, cleanup and notification.

mod common;

use std::time::Duration;

use common::{TestHarness, FFMPEG_FAIL};
use tokio_util::sync::CancellationToken;
use transforge::executor::ExecutionOutcome;
use transforge::validate::JobRequest;
use transforge_common::{ErrorCode, JobStatus, OwnerKey, TransformParams};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn received_within(server: &MockServer, count: usize, limit: Duration) -> Vec<wiremock::Request> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.len() >= count || tokio::time::Instant::now() >= deadline {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn failed_transcode_is_reported_without_leaking_paths() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let harness = TestHarness::with_tools(FFMPEG_FAIL, |_| {});
    harness.write_input("a.mov", b"raw");
    let job = harness
        .services
        .state
        .admission
        .admit(
            OwnerKey::new("studio-a").unwrap(),
            JobRequest {
                input: "a.mov".into(),
                params: TransformParams::default(),
                webhook_url: Some(format!("{}/hook", server.uri())),
                max_duration_secs: None,
            },
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let delivery = harness.services.broker.dequeue().await.unwrap().unwrap();
    let outcome = harness
        .services
        .workers
        .process_delivery(&delivery, &shutdown)
        .await
        .unwrap()
        .unwrap();
    let ExecutionOutcome::Failed { code, summary } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(code, ErrorCode::TransformFailed);
    assert!(!summary.contains("/srv/secret"), "summary leaked a path: {summary}");
    assert!(summary.contains("Invalid data found"), "summary lost the cause: {summary}");

    let failed = harness.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_code, Some(ErrorCode::TransformFailed));
    assert_eq!(failed.error_summary.as_deref(), Some(summary.as_str()));
    assert!(failed.output_ref.is_none());
    assert_eq!(harness.workspace_count(), 0);

    let requests = received_within(&server, 1, Duration::from_secs(5)).await;
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["job_id"], job.id.get());
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error_code"], "transform_failed");
    assert!(body.get("output_ref").is_none());
    let raw = String::from_utf8_lossy(&requests[0].body);
    assert!(!raw.contains("Invalid data"), "payload carried transcoder output: {raw}");
}

/// ffmpeg stand-in that echoes its input argument back in the error.
const FFMPEG_ECHO_INPUT_FAIL: &str = r#"#!/bin/sh
for arg; do
  case "$arg" in file:*input*) input="$arg" ;; esac
done
echo "Error opening input file $input: Invalid data found when processing input" >&2
exit 1
"#;

#[tokio::test]
async fn workspace_paths_with_spaces_are_scrubbed() {
    let harness = TestHarness::with_tools(FFMPEG_ECHO_INPUT_FAIL, |config| {
        config.workers.workspace_dir = config
            .workers
            .workspace_dir
            .as_ref()
            .map(|dir| dir.with_file_name("Jane Doe scratch space"));
    });
    harness.write_input("a.mov", b"raw");
    let job = harness
        .services
        .state
        .admission
        .admit(
            OwnerKey::new("studio-a").unwrap(),
            JobRequest {
                input: "a.mov".into(),
                params: TransformParams::default(),
                webhook_url: None,
                max_duration_secs: None,
            },
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    assert!(harness.services.workers.run_once(&shutdown).await.unwrap());

    let failed = harness.job(job.id).await;
    assert_eq!(failed.error_code, Some(ErrorCode::TransformFailed));
    let summary = failed.error_summary.unwrap();
    for leaked in ["Jane", "Doe", "scratch", "space", "transforge-job", "input."] {
        assert!(!summary.contains(leaked), "summary leaked {leaked:?}: {summary}");
    }
    assert_eq!(
        summary,
        "Error opening input file <path>: Invalid data found when processing input"
    );
}

#[tokio::test]
async fn missing_input_fails_as_storage_error() {
    let harness = TestHarness::new();
    let input = harness.write_input("gone.mov", b"raw");
    let job = harness
        .services
        .state
        .admission
        .admit(
            OwnerKey::new("studio-a").unwrap(),
            JobRequest {
                input: "gone.mov".into(),
                params: TransformParams::default(),
                webhook_url: None,
                max_duration_secs: None,
            },
        )
        .await
        .unwrap();
    std::fs::remove_file(input).unwrap();

    let shutdown = CancellationToken::new();
    assert!(harness.services.workers.run_once(&shutdown).await.unwrap());

    let failed = harness.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_code, Some(ErrorCode::StorageError));
    assert_eq!(harness.workspace_count(), 0);
}

#[tokio::test]
async fn completed_job_notifies_with_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/done"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let harness = TestHarness::new();
    harness.write_input("clip.mov", b"raw");
    let job = harness
        .services
        .state
        .admission
        .admit(
            OwnerKey::new("studio-a").unwrap(),
            JobRequest {
                input: "clip.mov".into(),
                params: TransformParams::default(),
                webhook_url: Some(format!("{}/done", server.uri())),
                max_duration_secs: None,
            },
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    assert!(harness.services.workers.run_once(&shutdown).await.unwrap());

    let requests = received_within(&server, 1, Duration::from_secs(5)).await;
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output_ref"], format!("outputs/job-{}/clip.mp4", job.id));
    assert!(body.get("error_code").is_none());
    assert!(body["finished_at"].is_string());
}
