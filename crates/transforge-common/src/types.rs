//! Core enums and parameter types shared between the store, the API and the
//! executor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the job can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the job counts against its owner's quota.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Sanitized failure category stored on failed jobs and sent to webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The transcoder exited non-zero or crashed.
    TransformFailed,
    /// Reading the input or writing the output failed.
    StorageError,
    /// The job exceeded its maximum duration.
    Timeout,
    /// The process running the job stopped before it finished.
    Interrupted,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::TransformFailed => "transform_failed",
            ErrorCode::StorageError => "storage_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Interrupted => "interrupted",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transform_failed" => Ok(ErrorCode::TransformFailed),
            "storage_error" => Ok(ErrorCode::StorageError),
            "timeout" => Ok(ErrorCode::Timeout),
            "interrupted" => Ok(ErrorCode::Interrupted),
            "internal" => Ok(ErrorCode::Internal),
            other => Err(format!("unknown error code: {other}")),
        }
    }
}

/// Output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl Container {
    /// Muxer name understood by the transcoder.
    pub fn muxer(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "matroska",
            Container::Webm => "webm",
            Container::Mov => "mov",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
            Container::Mov => "mov",
        }
    }
}

/// Video encoder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
    Vp9,
    Av1,
    /// Stream copy, no re-encode.
    Copy,
}

impl VideoCodec {
    /// Encoder name understood by the transcoder.
    pub fn encoder(self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Hevc => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Av1 => "libsvtav1",
            VideoCodec::Copy => "copy",
        }
    }
}

/// Audio encoder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Aac,
    Opus,
    Ac3,
    Flac,
    Copy,
    /// Drop audio entirely.
    None,
}

impl AudioCodec {
    /// Encoder name understood by the transcoder, `None` when audio is dropped.
    pub fn encoder(self) -> Option<&'static str> {
        match self {
            AudioCodec::Aac => Some("aac"),
            AudioCodec::Opus => Some("libopus"),
            AudioCodec::Ac3 => Some("ac3"),
            AudioCodec::Flac => Some("flac"),
            AudioCodec::Copy => Some("copy"),
            AudioCodec::None => None,
        }
    }
}

/// Encoder speed/quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Ultrafast,
    Veryfast,
    Fast,
    Medium,
    Slow,
    Veryslow,
}

impl Preset {
    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Veryfast => "veryfast",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
            Preset::Veryslow => "veryslow",
        }
    }
}

/// Requested transform operation.
///
/// Only the enums and bounded integers here ever reach the transcoder's
/// argument list; free text is limited to `title` (a metadata value) and
/// `output_name` (validated as a filename).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformParams {
    pub container: Container,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    /// Target video bitrate in kbit/s.
    pub video_bitrate_kbps: Option<u32>,
    /// Target audio bitrate in kbit/s.
    pub audio_bitrate_kbps: Option<u32>,
    /// Output width in pixels.
    pub width: Option<u32>,
    /// Output height in pixels.
    pub height: Option<u32>,
    /// Constant rate factor.
    pub crf: Option<u32>,
    pub preset: Option<Preset>,
    /// Title written into the output's metadata.
    pub title: Option<String>,
    /// Base name of the output object, without extension.
    pub output_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip_strings() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_classes() {
        assert!(JobStatus::Queued.is_active());
        assert!(JobStatus::Running.is_active());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Failed.is_active());
    }

    #[test]
    fn test_error_code_serde() {
        let json = serde_json::to_string(&ErrorCode::TransformFailed).unwrap();
        assert_eq!(json, "\"transform_failed\"");
        assert_eq!("timeout".parse::<ErrorCode>().unwrap(), ErrorCode::Timeout);
    }

    #[test]
    fn test_params_reject_unknown_fields() {
        let parsed: Result<TransformParams, _> =
            serde_json::from_str(r#"{"container":"mkv","extra_flags":"-f lavfi"}"#);
        assert!(parsed.is_err());

        let parsed: TransformParams =
            serde_json::from_str(r#"{"container":"webm","video_codec":"vp9"}"#).unwrap();
        assert_eq!(parsed.container, Container::Webm);
        assert_eq!(parsed.audio_codec, AudioCodec::Aac);
    }
}
