//! Migration API routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use ferry_engine::{BatchResult, MigrationEngine, Override};
use ferry_store::{PageRequest, Phase, RecordQuery, RecordStatus};

use crate::WebError;

/// Shared state for the HTTP server.
pub struct AppState {
    pub engine: Arc<MigrationEngine>,
}

impl AppState {
    pub fn new(engine: Arc<MigrationEngine>) -> Self {
        Self { engine }
    }
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        // Triggers
        .route("/phases/{phase}/run", post(run_phase))
        .route("/phases/{phase}/execute-specific", post(execute_specific))
        .route("/phases/{phase}/retry", post(retry_phase))
        .route("/retry-failed", post(retry_failed))
        // Reads
        .route("/phases/{phase}/records", get(list_records))
        .route("/phases/{phase}/records/{source_id}", get(get_record))
        .route("/phases/{phase}/statistics", get(phase_statistics))
        .route("/phases/{phase}/overrides", get(overrides))
        .route("/statistics", get(statistics))
        .with_state(state);

    Router::new()
        .nest("/api/migration", api)
        .layer(TraceLayer::new_for_http())
}

fn parse_phase(raw: &str) -> Result<Phase, WebError> {
    raw.parse().map_err(WebError::BadRequest)
}

/// Batch results are always returned as the body; ERROR batches with a 500.
fn batch_response(result: BatchResult) -> impl IntoResponse {
    let status = if result.is_error() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(result))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

// =============================================================================
// Triggers
// =============================================================================

async fn run_phase(
    State(state): State<Arc<AppState>>,
    Path(phase): Path<String>,
) -> Result<impl IntoResponse, WebError> {
    let phase = parse_phase(&phase)?;
    info!(%phase, "phase run requested");
    Ok(batch_response(state.engine.run_phase(phase).await))
}

#[derive(Debug, Deserialize)]
struct ExecuteSpecificRequest {
    ids: Vec<String>,
    #[serde(default, rename = "override")]
    override_by: Option<Override>,
}

async fn execute_specific(
    State(state): State<Arc<AppState>>,
    Path(phase): Path<String>,
    Json(request): Json<ExecuteSpecificRequest>,
) -> Result<impl IntoResponse, WebError> {
    let phase = parse_phase(&phase)?;
    let ids: Vec<String> = request
        .ids
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    if ids.is_empty() {
        return Err(WebError::BadRequest("ids must not be empty".to_string()));
    }
    if let Some(by) = &request.override_by {
        if by.operator.trim().is_empty() || by.reason.trim().is_empty() {
            return Err(WebError::BadRequest(
                "override requires an operator and a reason".to_string(),
            ));
        }
    }

    info!(%phase, ids = ids.len(), overridden = request.override_by.is_some(), "selective run requested");
    Ok(batch_response(
        state
            .engine
            .run_selected(phase, &ids, request.override_by)
            .await,
    ))
}

async fn retry_phase(
    State(state): State<Arc<AppState>>,
    Path(phase): Path<String>,
) -> Result<impl IntoResponse, WebError> {
    let phase = parse_phase(&phase)?;
    Ok(batch_response(state.engine.retry_phase(phase).await))
}

async fn retry_failed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    batch_response(state.engine.retry_all().await)
}

// =============================================================================
// Reads
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct RecordsParams {
    page: Option<u32>,
    size: Option<u32>,
    status: Option<String>,
    search: Option<String>,
}

impl RecordsParams {
    fn into_query(self) -> Result<RecordQuery, WebError> {
        let status = self
            .status
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<RecordStatus>())
            .transpose()
            .map_err(WebError::BadRequest)?;

        Ok(RecordQuery {
            status,
            search: self.search.filter(|s| !s.trim().is_empty()),
            page: PageRequest::new(
                self.page.unwrap_or(0),
                self.size.unwrap_or(PageRequest::DEFAULT_SIZE),
            ),
        })
    }
}

async fn list_records(
    State(state): State<Arc<AppState>>,
    Path(phase): Path<String>,
    Query(params): Query<RecordsParams>,
) -> Result<impl IntoResponse, WebError> {
    let phase = parse_phase(&phase)?;
    let query = params.into_query()?;
    Ok(Json(state.engine.list_records(phase, &query)?))
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    Path((phase, source_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, WebError> {
    let phase = parse_phase(&phase)?;
    state
        .engine
        .get_record(phase, &source_id)?
        .map(Json)
        .ok_or_else(|| WebError::NotFound(format!("{} record {}", phase, source_id)))
}

async fn phase_statistics(
    State(state): State<Arc<AppState>>,
    Path(phase): Path<String>,
) -> Result<impl IntoResponse, WebError> {
    let phase = parse_phase(&phase)?;
    Ok(Json(state.engine.phase_statistics(phase)))
}

async fn overrides(
    State(state): State<Arc<AppState>>,
    Path(phase): Path<String>,
) -> Result<impl IntoResponse, WebError> {
    let phase = parse_phase(&phase)?;
    Ok(Json(state.engine.overrides(phase)?))
}

async fn statistics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.statistics())
}
