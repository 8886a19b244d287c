use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    error::{StoreError, ValidationError},
    intake::{self, ScanRequest},
    job::{JobId, ScanJob, ScanStatus},
    orchestrator::ScanOrchestrator,
};

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<ScanOrchestrator>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanAccepted {
    pub scan_id: JobId,
    pub status: ScanStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    NotFound(JobId),
    Conflict(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, msg) = match self {
            Self::Validation(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            Self::NotFound(id) => (StatusCode::NOT_FOUND, format!("scan {id} not found")),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (code, Json(ErrorBody { error: msg })).into_response()
    }
}

/// API under `/api`, with the static dashboard from `ui/` as fallback.
pub fn router(orchestrator: Arc<ScanOrchestrator>) -> Router {
    let state = AppState { orchestrator };

    let api = Router::new()
        .route("/scans", get(list_scans).post(post_scan))
        .route("/scans/{id}", get(get_scan).delete(delete_scan))
        .route("/scans/{id}/cancel", post(cancel_scan))
        .with_state(state);

    let static_svc = ServeDir::new("ui").append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, orchestrator: Arc<ScanOrchestrator>) -> Result<()> {
    let app = router(orchestrator);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving API and UI");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scan = intake::validate(&req, &app.orchestrator.config().default_ports)
        .map_err(ApiError::Validation)?;
    let job = app.orchestrator.submit(scan).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ScanAccepted {
            scan_id: job.id,
            status: job.status,
            message: "Scan queued successfully".into(),
        }),
    ))
}

async fn list_scans(State(app): State<AppState>) -> Result<Json<Vec<ScanJob>>, ApiError> {
    Ok(Json(app.orchestrator.store().list_jobs().await?))
}

async fn get_scan(
    State(app): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ScanJob>, ApiError> {
    let id = JobId(id);
    app.orchestrator
        .store()
        .get_job(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

async fn cancel_scan(
    State(app): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let id = JobId(id);
    let job = app
        .orchestrator
        .store()
        .get_job(id)
        .await?
        .ok_or(ApiError::NotFound(id))?;
    if job.status.is_terminal() || !app.orchestrator.cancel(id).await {
        return Err(ApiError::Conflict(format!("scan {id} is {}", job.status)));
    }
    Ok(StatusCode::ACCEPTED)
}

async fn delete_scan(
    State(app): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let id = JobId(id);
    let store = app.orchestrator.store();
    let job = store.get_job(id).await?.ok_or(ApiError::NotFound(id))?;
    if !job.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "scan {id} is {}; cancel it before deleting",
            job.status
        )));
    }
    store.delete_job(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
