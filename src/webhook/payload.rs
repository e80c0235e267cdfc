use serde::Serialize;
use transforge_common::{ErrorCode, JobId, JobStatus};
use transforge_db::models::Job;

/// Body sent to a job's webhook target.
///
/// Failures are described only by their [`ErrorCode`]; the stored summary
/// stays behind the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl WebhookPayload {
    /// Build the payload for a completed or failed job. Other states are
    /// never announced.
    pub fn from_job(job: &Job) -> Option<Self> {
        let (error_code, output_ref) = match job.status {
            JobStatus::Completed => (None, job.output_ref.clone()),
            JobStatus::Failed => (Some(job.error_code.unwrap_or(ErrorCode::Internal)), None),
            JobStatus::Queued | JobStatus::Running | JobStatus::Cancelled => return None,
        };
        Some(Self {
            job_id: job.id,
            status: job.status,
            error_code,
            output_ref,
            finished_at: job.finished_at.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transforge_common::{OwnerKey, TransformParams};

    fn job(status: JobStatus) -> Job {
        Job {
            id: JobId::from_row(3),
            owner: OwnerKey::new("acme").unwrap(),
            input_ref: "in.mov".into(),
            output_ref: None,
            params: TransformParams::default(),
            status,
            progress: 0,
            error_code: None,
            error_summary: None,
            webhook_url: Some("https://hooks.example.com/x".into()),
            max_duration_secs: 60,
            created_at: "2026-01-01T00:00:00.000Z".into(),
            started_at: None,
            finished_at: Some("2026-01-01T00:01:00.000Z".into()),
        }
    }

    #[test]
    fn failed_payload_carries_code_not_summary() {
        let mut failed = job(JobStatus::Failed);
        failed.error_code = Some(ErrorCode::TransformFailed);
        failed.error_summary = Some("Invalid data found when processing input".into());

        let payload = WebhookPayload::from_job(&failed).unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error_code"], "transform_failed");
        assert_eq!(json["job_id"], 3);
        assert!(json.get("output_ref").is_none());
        assert!(!json.to_string().contains("Invalid data"));
    }

    #[test]
    fn completed_payload_carries_output() {
        let mut done = job(JobStatus::Completed);
        done.output_ref = Some("outputs/job-3/in.mp4".into());
        let json = serde_json::to_value(WebhookPayload::from_job(&done).unwrap()).unwrap();
        assert_eq!(json["output_ref"], "outputs/job-3/in.mp4");
        assert!(json.get("error_code").is_none());
    }

    #[test]
    fn other_states_are_not_announced() {
        for status in [JobStatus::Queued, JobStatus::Running, JobStatus::Cancelled] {
            assert!(WebhookPayload::from_job(&job(status)).is_none());
        }
    }
}
