//! Shared test harness for integration tests.
//!
//! [`TestHarness`] owns a temp storage root, a temp-file SQLite database and
//! a fully wired [`Services`]. Fake transcoder and prober shell scripts stand
//! in for ffmpeg/ffprobe; [`TestHarness::with_server`] starts Axum on a
//! random port for HTTP-level tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use transforge::config::{ApiKeyConfig, Config};
use transforge::recovery::{recover, RecoveryReport};
use transforge::server::{create_router, Services};
use transforge::storage::{LocalStorage, Storage};
use transforge::tools::ToolPaths;
use transforge_common::{JobId, JobStatus};
use transforge_db::models::{Job, OutboxState};
use transforge_db::pool::{get_conn, init_pool, DbPool, PooledConnection};

/// ffmpeg stand-in that reports progress and writes its last argument.
pub const FFMPEG_OK: &str = r#"#!/bin/sh
for last; do :; done
out="${last#file:}"
echo "out_time_us=1000000"
echo "progress=continue"
echo "out_time_us=3000000"
echo "progress=continue"
echo "out_time_us=4000000"
echo "progress=end"
printf 'transcoded' > "$out"
exit 0
"#;

/// ffmpeg stand-in that fails with a path-laden error.
pub const FFMPEG_FAIL: &str = r#"#!/bin/sh
echo "[in#0 @ 0x55d0c0a4e2c0] Error opening input: file:/srv/secret/media/transforge-job-9-xyz/input.mov: Invalid data found when processing input" >&2
echo "Error opening input file file:/srv/secret/media/input.mov." >&2
exit 1
"#;

/// ffmpeg stand-in that reports a little progress and then hangs.
pub const FFMPEG_HANG: &str = r#"#!/bin/sh
echo "out_time_us=1000000"
echo "progress=continue"
exec sleep 60
"#;

/// ffprobe stand-in that never answers.
pub const FFPROBE_HANG: &str = r#"#!/bin/sh
exec sleep 60
"#;

/// ffprobe stand-in reporting a four second input.
pub const FFPROBE_OK: &str = r#"#!/bin/sh
echo '{"format": {"duration": "4.000000"}}'
"#;

pub const USER_KEY: &str = "user-key-0123456789abcdef";
pub const OTHER_KEY: &str = "other-key-0123456789abcdef";
pub const ADMIN_KEY: &str = "admin-key-0123456789abcdef";

pub struct TestHarness {
    pub root: TempDir,
    pub data: TempDir,
    pub config: Config,
    pub db: DbPool,
    pub storage: Arc<LocalStorage>,
    pub tools: ToolPaths,
    pub services: Services,
}

impl TestHarness {
    /// Harness with fake tools that succeed.
    pub fn new() -> Self {
        Self::with_tools(FFMPEG_OK, |_| {})
    }

    /// Harness whose transcoder runs `ffmpeg_script`; `configure` may adjust
    /// the config before the services are built.
    pub fn with_tools(ffmpeg_script: &str, configure: impl FnOnce(&mut Config)) -> Self {
        Self::with_scripts(ffmpeg_script, FFPROBE_OK, configure)
    }

    /// Like [`TestHarness::with_tools`], with a custom prober as well.
    pub fn with_scripts(
        ffmpeg_script: &str,
        ffprobe_script: &str,
        configure: impl FnOnce(&mut Config),
    ) -> Self {
        let root = tempfile::tempdir().expect("failed to create storage root");
        let data = tempfile::tempdir().expect("failed to create data dir");

        let mut config = Config::default();
        config.storage.root = root.path().to_path_buf();
        config.database.path = data.path().join("transforge.db");
        config.workers.workspace_dir = Some(data.path().join("work"));
        config.workers.poll_interval_ms = 20;
        config.workers.progress_interval_ms = 0;
        config.webhook.base_delay_ms = 20;
        config.webhook.max_delay_ms = 1000;
        config.webhook.request_timeout_secs = 5;
        config.webhook.allow_http = true;
        config.webhook.trusted_hosts = vec!["127.0.0.1".to_string()];
        configure(&mut config);

        let tools = ToolPaths {
            ffmpeg: write_script(data.path(), "ffmpeg", ffmpeg_script),
            ffprobe: write_script(data.path(), "ffprobe", ffprobe_script),
        };

        let db = init_pool(
            config.database.path.to_str().expect("utf-8 db path"),
            config.database.pool_size,
        )
        .expect("failed to create pool");
        let storage = Arc::new(LocalStorage::new(root.path()).expect("failed to open storage"));
        let services = Services::build(
            config.clone(),
            db.clone(),
            Arc::clone(&storage) as Arc<dyn Storage>,
            tools.clone(),
        );

        Self {
            root,
            data,
            config,
            db,
            storage,
            tools,
            services,
        }
    }

    /// Fresh services over the same database and storage, as a restarted
    /// process would build them.
    pub fn restart(&self) -> Services {
        Services::build(
            self.config.clone(),
            self.db.clone(),
            Arc::clone(&self.storage) as Arc<dyn Storage>,
            self.tools.clone(),
        )
    }

    /// Run startup recovery with `services`.
    pub async fn recover_with(&self, services: &Services) -> RecoveryReport {
        recover(
            &services.store,
            services.broker.as_ref(),
            &services.dispatcher,
            &self.workspace_dir(),
        )
        .await
        .expect("recovery failed")
    }

    /// Poll until the job's webhook delivery reaches `state` or ten seconds
    /// pass.
    pub async fn wait_for_delivery(&self, id: JobId, state: OutboxState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let current = self
                .services
                .store
                .delivery_state(id)
                .await
                .expect("outbox readable");
            if current == Some(state) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "delivery of job {id} stuck in {current:?} waiting for {state:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Harness with auth enabled: `USER_KEY` (owner "studio-a"),
    /// `OTHER_KEY` (owner "studio-b") and `ADMIN_KEY`.
    pub fn with_auth() -> Self {
        Self::with_tools(FFMPEG_OK, |config| {
            config.auth.enabled = true;
            config.auth.keys = vec![
                key("user", USER_KEY, "studio-a", false),
                key("other", OTHER_KEY, "studio-b", false),
                key("admin", ADMIN_KEY, "ops", true),
            ];
        })
    }

    /// Start an Axum server on a random port.
    pub async fn with_server(self) -> (Self, SocketAddr) {
        let app = create_router(self.services.state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (self, addr)
    }

    /// Write a file under the storage root.
    pub fn write_input(&self, reference: &str, bytes: &[u8]) -> PathBuf {
        let path = self.root.path().join(reference);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create input dir");
        }
        std::fs::write(&path, bytes).expect("failed to write input");
        path
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.data.path().join("work")
    }

    /// Number of job workspaces currently on disk.
    pub fn workspace_count(&self) -> usize {
        std::fs::read_dir(self.workspace_dir())
            .map(|entries| entries.flatten().count())
            .unwrap_or(0)
    }

    pub fn conn(&self) -> PooledConnection {
        get_conn(&self.db).expect("failed to get db connection")
    }

    pub async fn job(&self, id: JobId) -> Job {
        self.services.store.require(id).await.expect("job exists")
    }

    /// Poll until the job reaches `status` or ten seconds pass.
    pub async fn wait_for_status(&self, id: JobId, status: JobStatus) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.job(id).await;
            if job.status == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} stuck in {} waiting for {status}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn key(name: &str, key: &str, owner: &str, admin: bool) -> ApiKeyConfig {
    ApiKeyConfig {
        name: name.to_string(),
        key: key.to_string(),
        owner: owner.to_string(),
        admin,
    }
}

/// Write an executable shell script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write script");
    let mut perms = std::fs::metadata(&path)
        .expect("script metadata")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("failed to chmod script");
    path
}
