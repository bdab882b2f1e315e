//! # Server Configuration
//!
//! Router, shared state and the OpenAPI document for the sync management API.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use reqwest::Client;
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::adapters::AdapterRegistry;
use crate::config::AppConfig;
use crate::handlers;
use crate::sync::notifier::{FanoutNotifier, Notifier};
use crate::sync::task_manager::TaskManager;
use crate::telemetry::{TraceContext, with_trace_context};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub manager: TaskManager,
}

impl AppState {
    /// Wires the adapter registry, notifier and task manager for `db`.
    pub fn build(config: Arc<AppConfig>, db: DatabaseConnection) -> Result<Self> {
        let notifier: Arc<dyn Notifier> = Arc::new(
            FanoutNotifier::from_config(&config.notify).context("invalid notification settings")?,
        );
        Ok(Self::with_notifier(config, db, notifier))
    }

    pub fn with_notifier(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = AdapterRegistry::new(db.clone(), Client::new());
        let manager = TaskManager::new(db, Arc::clone(&config), registry, notifier);
        Self { config, manager }
    }
}

/// Installs the request's correlation id for the handler and its error responses.
async fn trace_context(request: Request, next: Next) -> Response {
    let context = TraceContext::from_header(
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    with_trace_context(context, next.run(request)).await
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/sync/full", post(handlers::sync::start_full_sync))
        .route("/sync/incremental", post(handlers::sync::start_incremental_sync))
        .route("/notify/changes", post(handlers::notify::push_changes))
        .route("/tasks", get(handlers::tasks::list_tasks))
        .route("/tasks/{id}", get(handlers::tasks::get_task))
        .route("/tasks/{id}/cancel", post(handlers::tasks::cancel_task))
        .route("/tasks/{id}/resume", post(handlers::tasks::resume_task))
        .route("/tasks/{id}/operations", get(handlers::tasks::list_operations))
        .route(
            "/tasks/{id}/operations/{op_id}/retry",
            post(handlers::tasks::retry_operation),
        )
        .route("/conflicts", get(handlers::conflicts::list_conflicts))
        .route("/conflicts/{id}/resolve", post(handlers::conflicts::resolve_conflict))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context))
        .layer(TraceLayer::new_for_http())
}

/// Recovers interrupted tasks, then serves the API until shutdown.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> Result<()> {
    let config = Arc::new(config);
    let state = AppState::build(Arc::clone(&config), db)?;

    let recovered = state
        .manager
        .recover_interrupted(true)
        .await
        .map_err(|err| anyhow::anyhow!("startup recovery failed: {err}"))?;
    info!(
        resumed = recovered.resumed.len(),
        paused = recovered.paused.len(),
        "startup recovery finished"
    );

    let app = create_app(state);
    let addr = config.bind_addr().context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, profile = %config.profile, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::healthz,
        crate::handlers::sync::start_full_sync,
        crate::handlers::sync::start_incremental_sync,
        crate::handlers::notify::push_changes,
        crate::handlers::tasks::list_tasks,
        crate::handlers::tasks::get_task,
        crate::handlers::tasks::cancel_task,
        crate::handlers::tasks::resume_task,
        crate::handlers::tasks::list_operations,
        crate::handlers::tasks::retry_operation,
        crate::handlers::conflicts::list_conflicts,
        crate::handlers::conflicts::resolve_conflict,
    ),
    components(
        schemas(
            crate::error::ApiError,
            crate::handlers::types::TaskAccepted,
            crate::handlers::types::TasksResponse,
            crate::handlers::types::OperationsResponse,
            crate::handlers::types::ConflictView,
            crate::handlers::types::ConflictsResponse,
            crate::handlers::types::ResolveConflictRequest,
            crate::handlers::types::PushAccepted,
            crate::handlers::types::HealthResponse,
            crate::sync::task::SyncRequest,
            crate::sync::task::SyncOptions,
            crate::sync::task::TaskView,
            crate::sync::operation::OperationRecord,
            crate::sync::conflict::ResolveAction,
        )
    ),
    tags(
        (name = "sync", description = "Start full and incremental syncs"),
        (name = "tasks", description = "Task status, history and control"),
        (name = "conflicts", description = "Concurrent modification handling"),
        (name = "health", description = "Service health"),
    ),
    info(
        title = "Directory Sync API",
        description = "Management API for the directory reconciliation engine",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
