//! # Server Configuration
//!
//! Wiring of the sync service components, the Axum router, and the process
//! lifecycle for `serve`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::aggregation::{GraphUpdater, InProcessMessageQueue, MembershipAggregator};
use crate::backup::{BackupService, SyncJobsBackupSource};
use crate::config::AppConfig;
use crate::directory::{DirectoryMembershipProvider, GroupWriter, SnapshotDirectory};
use crate::handlers;
use crate::notifications::OutboxNotificationSender;
use crate::orchestration::{
    AggregatorClient, HttpAggregatorClient, LocalAggregatorClient, OrchestrationContext,
    OrchestrationLauncher, RecoveryOutcome, SyncOrchestrationWorkflow,
};
use crate::repositories::{
    BackupTrackerRepository, CheckpointRepository, CheckpointStore, JobStore, SyncJobRepository,
};
use crate::retry::RetryPolicy;
use crate::scheduler::JobScheduler;
use crate::scheduling::{HistoricalRuntimeEstimator, JobSchedulingService};
use crate::storage::{BlobPayloadStore, BlobStore, FsBlobStore, MembershipPayloadStore};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub jobs: Arc<dyn JobStore>,
    pub launcher: Arc<OrchestrationLauncher>,
    pub aggregator: Arc<MembershipAggregator>,
}

/// Every long-lived component of the service.
pub struct Services {
    pub state: AppState,
    pub scheduler: JobScheduler,
    pub backup: Arc<BackupService>,
}

/// Builds the component graph from configuration.
pub fn build_services(
    config: Arc<AppConfig>,
    db: Arc<DatabaseConnection>,
) -> anyhow::Result<Services> {
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.storage.root.clone()));
    let directory = Arc::new(SnapshotDirectory::new(Arc::clone(&blobs)));
    let provider: Arc<dyn DirectoryMembershipProvider> = directory.clone();
    let writer: Arc<dyn GroupWriter> = directory;

    let jobs: Arc<dyn JobStore> = Arc::new(SyncJobRepository::new(Arc::clone(&db)));
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(CheckpointRepository::new(Arc::clone(&db)));
    let payloads: Arc<dyn MembershipPayloadStore> =
        Arc::new(BlobPayloadStore::new(Arc::clone(&blobs)));
    let notifier = Arc::new(OutboxNotificationSender::new(
        Arc::clone(&blobs),
        config.notifications.clone(),
    ));
    let retry = RetryPolicy::from(&config.retry);

    let updater = Arc::new(GraphUpdater::new(
        Arc::clone(&jobs),
        Arc::clone(&provider),
        writer,
        notifier.clone(),
        retry,
        config.graph_updater.dry_run,
    ));
    let aggregator = Arc::new(MembershipAggregator::new(
        Arc::clone(&payloads),
        Arc::new(InProcessMessageQueue::new()),
        updater,
        chrono::Duration::seconds(config.graph_updater.session_timeout_seconds as i64),
    ));

    let aggregator_client: Arc<dyn AggregatorClient> = match config.aggregator.url.as_deref() {
        Some(url) => Arc::new(
            HttpAggregatorClient::new(url, &config.aggregator)
                .context("building membership aggregator client")?,
        ),
        None => Arc::new(LocalAggregatorClient::new(Arc::clone(&aggregator))),
    };

    let workflow = Arc::new(SyncOrchestrationWorkflow::new(OrchestrationContext {
        jobs: Arc::clone(&jobs),
        checkpoints: Arc::clone(&checkpoints),
        directory: provider,
        payloads,
        notifier,
        aggregator: aggregator_client,
        retry,
        dry_run: config.graph_updater.dry_run,
    }));
    let launcher = Arc::new(OrchestrationLauncher::new(
        Arc::clone(&jobs),
        workflow,
        config.scheduler.max_concurrency,
        config.scheduler.include_destination_part,
    ));

    let scheduling = JobSchedulingService::from_config(
        Arc::new(HistoricalRuntimeEstimator::new(checkpoints)),
        &config.scheduler,
    );
    let scheduler = JobScheduler::new(
        config.scheduler.clone(),
        Arc::clone(&jobs),
        scheduling,
        Arc::clone(&launcher),
    );

    let backup = Arc::new(BackupService::new(
        vec![Arc::new(SyncJobsBackupSource::new(Arc::clone(&db)))],
        blobs,
        BackupTrackerRepository::new(Arc::clone(&db)),
        config.backup.clone(),
    ));

    Ok(Services {
        state: AppState {
            config,
            db,
            jobs,
            launcher,
            aggregator,
        },
        scheduler,
        backup,
    })
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/api/orchestrations",
            post(handlers::orchestrations::start_orchestration),
        )
        .route(
            "/api/membership-aggregator",
            post(handlers::aggregator::receive_membership_part),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}

/// Starts the server and background loops; returns after shutdown.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let Services {
        state,
        scheduler,
        backup,
    } = build_services(Arc::clone(&config), Arc::new(db))?;

    let recovered = state
        .launcher
        .recover()
        .await
        .context("recovering interrupted orchestrations")?;
    let resumed = recovered
        .iter()
        .filter(|outcome| matches!(outcome, RecoveryOutcome::Resumed { .. }))
        .count();
    info!(
        resumed,
        abandoned = recovered.len() - resumed,
        "Recovered in-progress sync jobs"
    );

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();
    workers.push(tokio::spawn(scheduler.run(shutdown.clone())));
    workers.push(tokio::spawn(Arc::clone(&state.aggregator).run_sweeper(
        StdDuration::from_secs(config.graph_updater.sweep_interval_seconds),
        shutdown.clone(),
    )));
    if config.backup.enabled {
        workers.push(tokio::spawn(backup.run_loop(shutdown.clone())));
    }

    let app = create_app(state);
    let addr = config
        .bind_addr()
        .with_context(|| format!("invalid server address '{}'", config.api_bind_addr))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "Server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "Failed to listen for shutdown signal");
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for worker in workers {
        if let Err(err) = worker.await {
            error!(error = %err, "Background worker panicked");
        }
    }
    info!("Server stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::orchestrations::start_orchestration,
        crate::handlers::aggregator::receive_membership_part,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::orchestrations::StartOrchestrationRequest,
            crate::handlers::orchestrations::OrchestrationAccepted,
            crate::orchestration::MembershipAggregatorRequest,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Group Membership Sync API",
        description = "Scheduling, orchestration and aggregation of group membership syncs",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
