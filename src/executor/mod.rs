//! Task executor: runs one queued job to a terminal state.
//!
//! An execution owns a [`JobWorkspace`], streams the input into it, runs the
//! transcoder under supervision (cancellation, deadline, progress) and
//! uploads the output. Every failure is mapped to a sanitized [`ErrorCode`]
//! plus summary before it touches the job row; the raw cause only goes to
//! the log.

pub mod command;
mod pool;
pub mod progress;
pub mod sanitize;
pub mod workspace;

pub use command::TransformCommand;
pub use pool::{WorkerPool, WorkerPoolSettings};
pub use progress::{ProgressEstimator, ProgressSignal, INDETERMINATE_PROGRESS};
pub use workspace::JobWorkspace;

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use transforge_common::{ErrorCode, JobStatus};
use transforge_db::models::Job;

use crate::config::Config;
use crate::jobs::JobStore;
use crate::storage::Storage;
use crate::tools::{self, ToolPaths};

/// Bytes of transcoder stderr kept for the failure summary and debug log.
const STDERR_TAIL_BYTES: usize = 16 * 1024;

/// Tunables of the executor.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub tools: ToolPaths,
    /// Parent of the per-job workspaces, owned by this instance.
    pub workspace_dir: PathBuf,
    /// Minimum time between two persisted progress updates.
    pub progress_interval: Duration,
    /// Storage prefix under which outputs are written.
    pub output_prefix: String,
    pub max_input_bytes: u64,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config, tools: ToolPaths) -> Self {
        Self {
            tools,
            workspace_dir: config.workspace_root(),
            progress_interval: Duration::from_millis(config.workers.progress_interval_ms),
            output_prefix: config.storage.output_prefix.clone(),
            max_input_bytes: config.storage.max_input_bytes,
        }
    }
}

/// Terminal result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { output_ref: String },
    Failed { code: ErrorCode, summary: String },
    Cancelled,
}

/// Where an execution stopped, before the result is persisted.
#[derive(Debug)]
enum Attempt {
    Produced(String),
    Failed(ErrorCode, String),
    Stopped,
}

impl Attempt {
    fn failed(code: ErrorCode, summary: impl Into<String>) -> Self {
        Attempt::Failed(code, summary.into())
    }
}

/// Why supervision of the transcoder ended early.
enum Interruption {
    Cancelled,
    TimedOut,
}

#[derive(Clone)]
pub struct TaskExecutor {
    store: JobStore,
    storage: Arc<dyn Storage>,
    settings: Arc<ExecutorSettings>,
}

impl TaskExecutor {
    pub fn new(store: JobStore, storage: Arc<dyn Storage>, settings: ExecutorSettings) -> Self {
        Self {
            store,
            storage,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run a job that has already been moved to `running` and persist its
    /// terminal state.
    ///
    /// `cancel` fires both for user cancellation and for shutdown; the store
    /// tells the two apart. The workspace is gone when this returns.
    pub async fn execute(&self, job: &Job, cancel: &CancellationToken) -> ExecutionOutcome {
        let deadline = Instant::now() + Duration::from_secs(job.max_duration_secs);
        tracing::info!(job_id = %job.id, owner = %job.owner, "Executing job");

        let attempt = match JobWorkspace::create(&self.settings.workspace_dir, job.id).await {
            Ok(workspace) => {
                let attempt = self.run_in(&workspace, job, cancel, deadline).await;
                workspace.cleanup().await;
                attempt
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, "Failed to create workspace: {e}");
                Attempt::failed(ErrorCode::Internal, "failed to prepare a workspace")
            }
        };

        self.settle(job, attempt).await
    }

    async fn run_in(
        &self,
        workspace: &JobWorkspace,
        job: &Job,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Attempt {
        let input = workspace.file(&input_file_name(&job.input_ref));
        let output = workspace.file(&format!("output.{}", job.params.container.extension()));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Stopped,
            _ = tokio::time::sleep_until(deadline) => return timed_out(job),
            fetched = self.fetch_input(job, &input) => {
                if let Err(attempt) = fetched {
                    return attempt;
                }
            }
        }

        let duration = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Stopped,
            _ = tokio::time::sleep_until(deadline) => return timed_out(job),
            d = tools::probe_duration(&self.settings.tools.ffprobe, &input) => d,
        };
        tracing::debug!(job_id = %job.id, ?duration, "Probed input duration");

        if let Err(attempt) = self
            .transform(job, &input, &output, duration, cancel, deadline)
            .await
        {
            return attempt;
        }

        if cancel.is_cancelled() {
            return Attempt::Stopped;
        }
        // A cancel during upload is settled against the store afterwards.
        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => {
                self.discard_output(job).await;
                timed_out(job)
            }
            uploaded = self.upload(job, &output) => uploaded,
        }
    }

    /// Remove an output whose upload was cut short, in case it landed.
    async fn discard_output(&self, job: &Job) {
        let reference = output_ref(&self.settings.output_prefix, job);
        if let Err(e) = self.storage.delete(&reference).await {
            tracing::warn!(job_id = %job.id, "Failed to remove abandoned output: {e}");
        }
    }

    /// Stream the input object into the workspace without buffering it.
    async fn fetch_input(&self, job: &Job, dest: &Path) -> Result<(), Attempt> {
        let limit = self.settings.max_input_bytes;
        let opened = self.storage.get(&job.input_ref).await.map_err(|e| {
            tracing::error!(job_id = %job.id, "Failed to open input: {e}");
            Attempt::failed(ErrorCode::StorageError, "failed to read the input")
        })?;

        if opened.size > limit {
            tracing::warn!(job_id = %job.id, size = opened.size, limit, "Input grew past the size limit after admission");
            return Err(Attempt::failed(
                ErrorCode::StorageError,
                "input exceeds the size limit",
            ));
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            tracing::error!(job_id = %job.id, "Failed to create workspace input: {e}");
            Attempt::failed(ErrorCode::Internal, "failed to prepare the input")
        })?;
        let mut reader = opened.reader.take(limit.saturating_add(1));
        let copied = tokio::io::copy(&mut reader, &mut file).await.map_err(|e| {
            tracing::error!(job_id = %job.id, "Failed to copy input: {e}");
            Attempt::failed(ErrorCode::StorageError, "failed to read the input")
        })?;

        if copied > limit {
            return Err(Attempt::failed(
                ErrorCode::StorageError,
                "input exceeds the size limit",
            ));
        }
        tracing::debug!(job_id = %job.id, bytes = copied, "Input copied into workspace");
        Ok(())
    }

    /// Run the transcoder to exit, feeding its progress stream to the store.
    async fn transform(
        &self,
        job: &Job,
        input: &Path,
        output: &Path,
        duration: Option<Duration>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), Attempt> {
        let command =
            TransformCommand::for_transform(&self.settings.tools.ffmpeg, input, output, &job.params)
                .map_err(|e| {
                    tracing::error!(job_id = %job.id, "Failed to build transcoder command: {e}");
                    Attempt::failed(ErrorCode::Internal, "failed to prepare the transform")
                })?;

        let mut child = command.spawn().map_err(|e| {
            tracing::error!(job_id = %job.id, "{e}");
            Attempt::failed(ErrorCode::TransformFailed, "transcoder could not be started")
        })?;

        let stderr_tail = child.stderr.take().map(|s| tokio::spawn(collect_tail(s)));
        let stdout = child.stdout.take();

        let exit = self
            .supervise(job, &mut child, stdout, duration, cancel, deadline)
            .await;

        let stderr = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        match exit {
            Err(Interruption::Cancelled) => Err(Attempt::Stopped),
            Err(Interruption::TimedOut) => Err(timed_out(job)),
            Ok(Err(e)) => {
                tracing::error!(job_id = %job.id, "Failed waiting for transcoder: {e}");
                Err(Attempt::failed(ErrorCode::Internal, "lost track of the transcoder"))
            }
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => {
                tracing::debug!(job_id = %job.id, %status, stderr = %stderr, "Transcoder stderr");
                let mut known_dirs: Vec<&Path> = input.parent().into_iter().collect();
                known_dirs.push(&self.settings.workspace_dir);
                known_dirs.extend(self.storage.local_root());
                let summary = sanitize::sanitize_stderr(&stderr, &known_dirs);
                tracing::warn!(job_id = %job.id, %status, summary = %summary, "Transcoder failed");
                Err(Attempt::Failed(ErrorCode::TransformFailed, summary))
            }
        }
    }

    async fn supervise(
        &self,
        job: &Job,
        child: &mut Child,
        stdout: Option<tokio::process::ChildStdout>,
        duration: Option<Duration>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<std::io::Result<ExitStatus>, Interruption> {
        let mut estimator = ProgressEstimator::new(duration);
        let mut persisted = 0u8;
        let mut last_write: Option<Instant> = None;

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        kill(job, child).await;
                        return Err(Interruption::Cancelled);
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        kill(job, child).await;
                        return Err(Interruption::TimedOut);
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let Some(signal) = progress::parse_progress_line(&line) else {
                                continue;
                            };
                            let value = estimator.update(signal);
                            // 100 is written by the completing transition.
                            let due = last_write
                                .map_or(true, |t| t.elapsed() >= self.settings.progress_interval);
                            if value > persisted && value < 100 && due {
                                if let Err(e) = self.store.update_progress(job.id, value).await {
                                    tracing::warn!(job_id = %job.id, "Failed to persist progress: {e}");
                                }
                                persisted = value;
                                last_write = Some(Instant::now());
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, "Failed reading progress stream: {e}");
                            break;
                        }
                    }
                }
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                kill(job, child).await;
                Err(Interruption::Cancelled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                kill(job, child).await;
                Err(Interruption::TimedOut)
            }
            status = child.wait() => Ok(status),
        }
    }

    async fn upload(&self, job: &Job, output: &Path) -> Attempt {
        let mut file = match tokio::fs::File::open(output).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(job_id = %job.id, "Transcoder exited cleanly without output: {e}");
                return Attempt::failed(ErrorCode::TransformFailed, "transcoder produced no output");
            }
        };

        let reference = output_ref(&self.settings.output_prefix, job);
        match self.storage.put(&reference, &mut file).await {
            Ok(stored) => Attempt::Produced(stored),
            Err(e) => {
                tracing::error!(job_id = %job.id, "Failed to store output: {e}");
                Attempt::failed(ErrorCode::StorageError, "failed to store the output")
            }
        }
    }

    /// Persist the terminal state. Losing a race to a cancellation leaves the
    /// job cancelled; an uploaded output is then removed again.
    async fn settle(&self, job: &Job, attempt: Attempt) -> ExecutionOutcome {
        match attempt {
            Attempt::Produced(output_ref) => {
                match self.store.complete(job.id, output_ref.clone()).await {
                    Ok(true) => {
                        tracing::info!(job_id = %job.id, output = %output_ref, "Job completed");
                        ExecutionOutcome::Completed { output_ref }
                    }
                    Ok(false) => {
                        tracing::info!(job_id = %job.id, "Job was cancelled during upload, removing output");
                        if let Err(e) = self.storage.delete(&output_ref).await {
                            tracing::warn!(job_id = %job.id, "Failed to remove output of cancelled job: {e}");
                        }
                        ExecutionOutcome::Cancelled
                    }
                    Err(e) => self.unrecorded(job, e),
                }
            }
            Attempt::Failed(code, summary) => self.record_failure(job, code, summary).await,
            Attempt::Stopped => match self.store.get(job.id).await {
                Ok(Some(current)) if current.status == JobStatus::Running => {
                    // Stopped without a user cancel: the process is shutting down.
                    self.record_failure(
                        job,
                        ErrorCode::Interrupted,
                        "the worker running this job stopped".to_string(),
                    )
                    .await
                }
                Ok(_) => {
                    tracing::info!(job_id = %job.id, "Job cancelled");
                    ExecutionOutcome::Cancelled
                }
                Err(e) => self.unrecorded(job, e),
            },
        }
    }

    async fn record_failure(&self, job: &Job, code: ErrorCode, summary: String) -> ExecutionOutcome {
        match self.store.fail(job.id, code, summary.clone()).await {
            Ok(true) => {
                tracing::warn!(job_id = %job.id, code = %code, "Job failed");
                ExecutionOutcome::Failed { code, summary }
            }
            Ok(false) => {
                tracing::info!(job_id = %job.id, "Job was cancelled before its failure was recorded");
                ExecutionOutcome::Cancelled
            }
            Err(e) => self.unrecorded(job, e),
        }
    }

    /// The store is unreachable; startup recovery will fail the job as
    /// interrupted.
    fn unrecorded(&self, job: &Job, e: transforge_common::Error) -> ExecutionOutcome {
        tracing::error!(job_id = %job.id, "Failed to record job outcome: {e}");
        ExecutionOutcome::Failed {
            code: ErrorCode::Internal,
            summary: "failed to record the job outcome".to_string(),
        }
    }
}

fn timed_out(job: &Job) -> Attempt {
    Attempt::Failed(
        ErrorCode::Timeout,
        format!(
            "job exceeded its maximum duration of {} seconds",
            job.max_duration_secs
        ),
    )
}

async fn kill(job: &Job, child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(job_id = %job.id, "Failed to kill transcoder: {e}");
    }
}

/// Read a stream to its end, keeping only the last bytes.
async fn collect_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Workspace name of the input copy. A short alphanumeric extension is kept
/// so the transcoder can use it as a format hint.
fn input_file_name(input_ref: &str) -> String {
    let ext = Path::new(input_ref)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()));
    match ext {
        Some(ext) => format!("input.{}", ext.to_ascii_lowercase()),
        None => "input".to_string(),
    }
}

/// `{prefix}/job-{id}/{name}.{ext}`, where the name is the requested output
/// name or the input's stem.
fn output_ref(prefix: &str, job: &Job) -> String {
    let name = job
        .params
        .output_name
        .clone()
        .or_else(|| {
            Path::new(&job.input_ref)
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "output".to_string());
    let prefix = prefix.trim_matches('/');
    let file = format!("{name}.{}", job.params.container.extension());
    if prefix.is_empty() {
        format!("job-{}/{file}", job.id)
    } else {
        format!("{prefix}/job-{}/{file}", job.id)
    }
}
