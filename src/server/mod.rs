//! HTTP surface and service wiring.

pub mod auth;
pub mod error;
pub mod routes_jobs;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{middleware, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use transforge_db::pool::DbPool;

use crate::config::Config;
use crate::executor::{ExecutorSettings, TaskExecutor, WorkerPool, WorkerPoolSettings};
use crate::jobs::{AdmissionService, CancellationRegistry, JobStore};
use crate::queue::{Broker, SqliteBroker};
use crate::storage::{LocalStorage, Storage};
use crate::tools::ToolPaths;
use crate::validate::{Validator, ValidatorSettings};
use crate::webhook::{DispatcherSettings, WebhookDispatcher};

use self::auth::Authenticator;

/// Extra lease time on top of the longest permitted job.
const LEASE_MARGIN: Duration = Duration::from_secs(300);

/// State shared by the request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub admission: AdmissionService,
    pub store: JobStore,
    pub registry: CancellationRegistry,
    pub auth: Arc<Authenticator>,
}

/// Every long-lived component of a running service.
#[derive(Clone)]
pub struct Services {
    pub state: AppState,
    pub store: JobStore,
    pub broker: Arc<dyn Broker>,
    pub workers: WorkerPool,
    pub dispatcher: WebhookDispatcher,
    pub shutdown: CancellationToken,
}

impl Services {
    /// Wire the components together. Nothing is started.
    pub fn build(
        config: Config,
        db: DbPool,
        storage: Arc<dyn Storage>,
        tools: ToolPaths,
    ) -> Self {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let store = JobStore::new(db.clone());

        let lease = Duration::from_secs(config.workers.max_duration_cap_secs) + LEASE_MARGIN;
        let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::new(db, lease));
        let registry = CancellationRegistry::new();

        let validator = Validator::new(
            Arc::clone(&storage),
            ValidatorSettings::from_config(&config),
        );
        let admission = AdmissionService::new(
            validator,
            store.clone(),
            Arc::clone(&broker),
            config.quota.max_active_jobs_per_owner,
        );

        let dispatcher = WebhookDispatcher::new(
            store.clone(),
            DispatcherSettings::from_config(&config),
            shutdown.clone(),
        );
        let executor = TaskExecutor::new(
            store.clone(),
            storage,
            ExecutorSettings::from_config(&config, tools),
        );
        let workers = WorkerPool::new(
            store.clone(),
            Arc::clone(&broker),
            executor,
            registry.clone(),
            dispatcher.clone(),
            WorkerPoolSettings::from_config(&config),
        );

        let state = AppState {
            auth: Arc::new(Authenticator::from_config(&config.auth)),
            config,
            admission,
            store: store.clone(),
            registry,
        };

        Self {
            state,
            store,
            broker,
            workers,
            dispatcher,
            shutdown,
        }
    }
}

/// Create the Axum router with all routes
pub fn create_router(state: AppState) -> Router {
    let api = routes_jobs::job_routes().layer(middleware::from_fn_with_state(
        state.clone(),
        auth::auth_middleware,
    ));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Run the service until a shutdown signal arrives.
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let db_path = config.database.path.to_string_lossy().into_owned();
    let db = transforge_db::pool::init_pool(&db_path, config.database.pool_size)
        .with_context(|| format!("Failed to open database at {db_path}"))?;
    let storage: Arc<dyn Storage> = Arc::new(
        LocalStorage::new(&config.storage.root)
            .with_context(|| format!("Failed to open storage root {:?}", config.storage.root))?,
    );
    let tools = ToolPaths::resolve(&config.tools);
    tracing::info!(ffmpeg = %tools.ffmpeg.display(), ffprobe = %tools.ffprobe.display(), "Using tools");

    let services = Services::build(config, db, storage, tools);
    let config = Arc::clone(&services.state.config);

    crate::recovery::recover(
        &services.store,
        services.broker.as_ref(),
        &services.dispatcher,
        &config.workspace_root(),
    )
    .await
    .context("Startup recovery failed")?;

    let mut background = services.workers.spawn(&services.shutdown);
    background.push(tokio::spawn(crate::retention::run_retention(
        services.store.clone(),
        config.retention.completed_job_days,
        Duration::from_secs(config.retention.sweep_interval_secs),
        services.shutdown.clone(),
    )));

    let app = create_router(services.state.clone());
    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = services.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    services.shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!("Background task ended abnormally: {e}");
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
