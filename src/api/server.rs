use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::db::resolve_db_config;
use crate::pipeline::runner::JobRunner;
use crate::pipeline::service::{build_service, JobService, ServiceConfig};
use crate::provider::HttpGenerationProvider;
use crate::storage::LocalArtifactStore;

#[derive(Clone)]
pub struct AppState {
    pub service_name: &'static str,
    pub service_version: &'static str,
    pub started_unix_ms: u128,
    pub service: JobService,
    pub runner: JobRunner,
}

impl AppState {
    pub fn new(service: JobService, runner: JobRunner) -> Self {
        Self {
            service_name: "atelier-backend-core",
            service_version: env!("CARGO_PKG_VERSION"),
            started_unix_ms: now_unix_ms(),
            service,
            runner,
        }
    }
}

/// Production wiring: env config, sqlite store, local artifact store and the
/// HTTP generation provider.
pub fn build_router() -> Router {
    let repo_root = default_repo_root();
    let config = ServiceConfig::from_env();
    let db_config = resolve_db_config(repo_root.as_path());
    let artifacts = Arc::new(LocalArtifactStore::from_env(repo_root.as_path()));

    let service = build_service(db_config.app_db_path, artifacts.clone(), config);
    service
        .store()
        .initialize()
        .expect("job store should initialize schema");

    let runner = JobRunner::new(
        service.store().clone(),
        Arc::new(HttpGenerationProvider::from_env()),
        artifacts,
    );
    build_router_with_components(service, runner)
}

/// Test seam: callers supply the service and runner, typically with scripted
/// providers and a temp database.
pub fn build_router_with_components(service: JobService, runner: JobRunner) -> Router {
    let state = AppState::new(service, runner);

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/jobs",
            get(crate::api::jobs::list_jobs_handler).post(crate::api::jobs::create_job_handler),
        )
        .route("/api/jobs/{jobId}", get(crate::api::jobs::get_job_handler))
        .route(
            "/api/jobs/{jobId}/cancel",
            post(crate::api::jobs::cancel_job_handler),
        )
        .route(
            "/api/ledger/{ownerId}",
            get(crate::api::ledger::get_balance_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router();
    info!(bind = %addr, "starting atelier-backend-core HTTP surface");
    axum::serve(listener, app).await
}

fn default_repo_root() -> PathBuf {
    let fallback = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    fallback.canonicalize().unwrap_or(fallback)
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "status": "ok",
            "service": state.service_name,
            "version": state.service_version,
            "started_unix_ms": state.started_unix_ms,
        })),
    )
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
