//! REST handlers for graph editing, map publishing, and session traffic.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use outreach_core::{ErrorKind, OutreachError};
use outreach_flow::lifecycle::Transition;
use outreach_flow::normalizer::{normalize_graph_with_diagnostics, Diagnostic};
use outreach_flow::types::{
    ConversationEvent, ConversationMap, ConversationSession, FlowEdge, FlowEvent, FlowGraph,
};
use outreach_flow::{default_graph, resolve_edge, ConversationEngine};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

/// Maximum length of caller-supplied identifiers (run, lead, experiment ids).
const MAX_FIELD_LEN: usize = 256;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConversationEngine,
    pub node_id: String,
    pub start_time: Instant,
}

// ─── Error mapping ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub hint: String,
    pub context: serde_json::Value,
}

/// Handler error: a lifecycle error or a rejected request.
#[derive(Debug)]
pub enum ApiError {
    Flow(OutreachError),
    BadRequest(String),
}

impl From<OutreachError> for ApiError {
    fn from(e: OutreachError) -> Self {
        ApiError::Flow(e)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::MapNotFound | ErrorKind::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorKind::NoPublishedMap
        | ErrorKind::MapArchived
        | ErrorKind::SessionClosed
        | ErrorKind::SessionExists
        | ErrorKind::InvalidTransition
        | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::RevisionMissing
        | ErrorKind::Storage
        | ErrorKind::Config
        | ErrorKind::Serialization
        | ErrorKind::Io
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                metrics::counter!("api.validation_errors").increment(1);
                let body = ErrorResponse {
                    error: "invalid_request".to_string(),
                    message,
                    hint: "Fix the request body or path and retry".to_string(),
                    context: serde_json::Value::Null,
                };
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            ApiError::Flow(e) => {
                let status = status_for(e.kind());
                if status.is_server_error() {
                    error!(error = %e, kind = e.kind().as_str(), "Request failed");
                } else {
                    warn!(error = %e, kind = e.kind().as_str(), "Request rejected");
                }
                metrics::counter!("api.errors", "kind" => e.kind().as_str()).increment(1);
                let body = ErrorResponse {
                    error: e.kind().as_str().to_string(),
                    message: e.to_string(),
                    hint: e.hint().to_string(),
                    context: e.context(),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn validate_id(value: &str, field: &'static str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("'{field}' must not be empty")));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(ApiError::BadRequest(format!(
            "'{field}' exceeds maximum length of {MAX_FIELD_LEN}"
        )));
    }
    Ok(())
}

// ─── Operational ──────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub store: String,
    pub uptime_secs: u64,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        store: state.engine.store().backend().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// ─── Graphs ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct NormalizeResponse {
    pub graph: FlowGraph,
    pub diagnostics: Vec<Diagnostic>,
}

/// POST /v1/graphs/normalize: any JSON in, a valid graph out.
pub async fn normalize(Json(raw): Json<serde_json::Value>) -> Json<NormalizeResponse> {
    let normalized = normalize_graph_with_diagnostics(&raw);
    metrics::counter!("api.graphs.normalized").increment(1);
    Json(NormalizeResponse {
        graph: normalized.graph,
        diagnostics: normalized.diagnostics,
    })
}

/// GET /v1/graphs/default
pub async fn default_template() -> Json<FlowGraph> {
    Json(default_graph())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// Normalized on the way in.
    pub graph: FlowGraph,
    pub node_id: String,
    pub event: FlowEvent,
}

#[derive(Serialize)]
pub struct ResolveResponse {
    pub edge: Option<FlowEdge>,
}

/// POST /v1/graphs/resolve: which edge an event would take from a node.
pub async fn resolve(Json(request): Json<ResolveRequest>) -> Json<ResolveResponse> {
    let edge = resolve_edge(&request.graph, &request.node_id, &request.event).cloned();
    Json(ResolveResponse { edge })
}

// ─── Maps ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenMapParams {
    pub brand_id: Option<String>,
    pub campaign_id: Option<String>,
    pub name: Option<String>,
}

/// GET /v1/experiments/:experiment_id/map: returns the map, creating it with
/// the default graph on first access.
pub async fn open_map(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Query(params): Query<OpenMapParams>,
) -> ApiResult<ConversationMap> {
    validate_id(&experiment_id, "experimentId")?;
    let map = state
        .engine
        .open_map(
            params.brand_id.as_deref().unwrap_or_default(),
            params.campaign_id.as_deref().unwrap_or_default(),
            &experiment_id,
            params.name.as_deref().unwrap_or(&experiment_id),
        )
        .await?;
    Ok(Json(map))
}

#[derive(Serialize)]
pub struct DraftResponse {
    pub map: ConversationMap,
    pub diagnostics: Vec<Diagnostic>,
}

/// PUT /v1/experiments/:experiment_id/map/draft: body is a raw graph.
pub async fn save_draft(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Json(raw): Json<serde_json::Value>,
) -> ApiResult<DraftResponse> {
    validate_id(&experiment_id, "experimentId")?;
    let (map, diagnostics) = state.engine.save_draft(&experiment_id, &raw).await?;
    Ok(Json(DraftResponse { map, diagnostics }))
}

/// POST /v1/experiments/:experiment_id/map/publish
pub async fn publish(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
) -> ApiResult<ConversationMap> {
    validate_id(&experiment_id, "experimentId")?;
    Ok(Json(state.engine.publish(&experiment_id).await?))
}

/// POST /v1/experiments/:experiment_id/map/archive
pub async fn archive_map(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
) -> ApiResult<ConversationMap> {
    validate_id(&experiment_id, "experimentId")?;
    Ok(Json(state.engine.archive_map(&experiment_id).await?))
}

// ─── Sessions ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub lead_id: String,
    pub experiment_id: String,
}

/// POST /v1/runs/:run_id/sessions
pub async fn start_session(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(request): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<ConversationSession>), ApiError> {
    validate_id(&run_id, "runId")?;
    validate_id(&request.lead_id, "leadId")?;
    validate_id(&request.experiment_id, "experimentId")?;

    let session = state
        .engine
        .start_session(&run_id, &request.lead_id, &request.experiment_id)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /v1/runs/:run_id/events: the run's audit log in append order.
pub async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Vec<ConversationEvent>> {
    Ok(Json(state.engine.list_events_by_run(&run_id).await?))
}

/// GET /v1/sessions/:session_id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<ConversationSession> {
    Ok(Json(state.engine.get_session(session_id).await?))
}

/// POST /v1/sessions/:session_id/events: body is a classified reply or a timer.
pub async fn session_event(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(event): Json<FlowEvent>,
) -> ApiResult<Transition> {
    if let FlowEvent::Intent { confidence, .. } = event {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ApiError::BadRequest(
                "'confidence' must be within [0, 1]".to_string(),
            ));
        }
    }
    Ok(Json(state.engine.handle_event(session_id, event).await?))
}

/// POST /v1/sessions/:session_id/approve
pub async fn approve(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<ConversationSession> {
    Ok(Json(state.engine.approve(session_id).await?))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

/// POST /v1/sessions/:session_id/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<ConversationSession> {
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "canceled".to_string());
    Ok(Json(state.engine.cancel(session_id, &reason).await?))
}
