//! External tool discovery and the media duration probe.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::ToolsConfig;

/// How long the duration probe may run before it counts as missing metadata.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved executables for the transcoder and the prober.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl ToolPaths {
    /// Use configured paths that exist, else search `PATH`, else fall back to
    /// the bare name and let spawning report the failure.
    pub fn resolve(config: &ToolsConfig) -> Self {
        Self {
            ffmpeg: resolve_one("ffmpeg", config.ffmpeg_path.as_deref()),
            ffprobe: resolve_one("ffprobe", config.ffprobe_path.as_deref()),
        }
    }
}

fn resolve_one(name: &str, configured: Option<&Path>) -> PathBuf {
    if let Some(p) = configured {
        if p.exists() {
            return p.to_path_buf();
        }
        tracing::warn!(tool = name, path = %p.display(), "Configured tool path does not exist, searching PATH");
    }
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

/// Availability of one tool, as reported by `check-tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// First line of `-version` output.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// Check both tools by running `-version`.
pub async fn check_tools(paths: &ToolPaths) -> Vec<ToolInfo> {
    let mut infos = Vec::with_capacity(2);
    for (name, path) in [("ffmpeg", &paths.ffmpeg), ("ffprobe", &paths.ffprobe)] {
        let version = detect_version(path).await;
        infos.push(ToolInfo {
            name: name.to_string(),
            available: version.is_some(),
            version,
            path: which::which(path).ok(),
        });
    }
    infos
}

async fn detect_version(path: &Path) -> Option<String> {
    let output = Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(PROBE_TIMEOUT, output).await.ok()?.ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|s| s.to_string())
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse the JSON printed by `ffprobe -show_entries format=duration -of json`.
pub fn parse_probe_duration(json: &str) -> Option<Duration> {
    let parsed: ProbeOutput = serde_json::from_str(json).ok()?;
    let secs: f64 = parsed.format?.duration?.trim().parse().ok()?;
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Ask the prober for the container duration of a local file.
///
/// Any failure (missing tool, timeout, unparsable output, zero length) is
/// reported as `None`, which the progress estimator treats as missing
/// metadata.
pub async fn probe_duration(ffprobe: &Path, input: &Path) -> Option<Duration> {
    let mut target = std::ffi::OsString::from("file:");
    target.push(input.as_os_str());

    let output = Command::new(ffprobe)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
        .arg(target)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::warn!("Duration probe failed to run: {e}");
            return None;
        }
        Err(_) => {
            tracing::warn!("Duration probe timed out");
            return None;
        }
    };
    if !output.status.success() {
        tracing::debug!(
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Duration probe exited with {}",
            output.status
        );
        return None;
    }
    parse_probe_duration(&String::from_utf8_lossy(&output.stdout))
}
