use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Directory holding this instance's job workspaces.
    ///
    /// Startup removes every leftover workspace in it, so it must not be
    /// shared with another instance. Unless configured it sits next to the
    /// database file: `./transforge.db` gets `./transforge-workspaces`.
    pub fn workspace_root(&self) -> PathBuf {
        if let Some(dir) = &self.workers.workspace_dir {
            return dir.clone();
        }
        let stem = self
            .database
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("transforge");
        self.database
            .path
            .with_file_name(format!("{stem}-workspaces"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Require a bearer token on every API request
    #[serde(default)]
    pub enabled: bool,

    /// Accepted API keys (generate with `transforge generate-api-key`)
    #[serde(default)]
    pub keys: Vec<ApiKeyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKeyConfig {
    /// Label used in logs; never the key itself
    pub name: String,

    pub key: String,

    /// Owner charged for jobs submitted with this key
    pub owner: String,

    /// Admins can read and cancel every owner's jobs
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory every input and output reference is resolved under
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// Prefix (relative to root) that outputs are written under
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    /// Largest accepted input, in bytes
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: u64,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./media")
}
fn default_output_prefix() -> String {
    "outputs".to_string()
}
fn default_max_input_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            output_prefix: default_output_prefix(),
            max_input_bytes: default_max_input_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./transforge.db")
}
fn default_pool_size() -> u32 {
    8
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkersConfig {
    /// Number of jobs executed in parallel
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// How long an idle worker waits before polling the queue again
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Minimum gap between persisted progress updates for one job
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Parent directory for per-job workspaces (a directory next to the
    /// database if unset)
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,

    /// Maximum run time for a job that does not ask for one
    #[serde(default = "default_max_duration_secs")]
    pub default_max_duration_secs: u64,

    /// Upper bound on any requested maximum run time
    #[serde(default = "default_max_duration_cap_secs")]
    pub max_duration_cap_secs: u64,
}

fn default_worker_count() -> usize {
    2
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_progress_interval_ms() -> u64 {
    1000
}
fn default_max_duration_secs() -> u64 {
    3600
}
fn default_max_duration_cap_secs() -> u64 {
    6 * 3600
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            workspace_dir: None,
            default_max_duration_secs: default_max_duration_secs(),
            max_duration_cap_secs: default_max_duration_cap_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    /// Queued + running jobs allowed per owner
    #[serde(default = "default_max_active_jobs")]
    pub max_active_jobs_per_owner: u32,
}

fn default_max_active_jobs() -> u32 {
    4
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_active_jobs_per_owner: default_max_active_jobs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Attempts before a delivery is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubled on each further retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the delay between attempts
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of each delay that is randomized (0.0 - 1.0)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Accept plain-http targets (closed networks only)
    #[serde(default)]
    pub allow_http: bool,

    /// Hosts exempt from the private-address check
    #[serde(default)]
    pub trusted_hosts: Vec<String>,

    /// When set, deliveries carry an HMAC-SHA256 signature header
    #[serde(default)]
    pub signing_secret: Option<String>,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            request_timeout_secs: default_request_timeout_secs(),
            allow_http: false,
            trusted_hosts: Vec::new(),
            signing_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Terminal jobs older than this are deleted (0 disables pruning)
    #[serde(default = "default_completed_job_days")]
    pub completed_job_days: u32,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_completed_job_days() -> u32 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_job_days: default_completed_job_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
}
