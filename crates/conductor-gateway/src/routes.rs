use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use conductor_agent::GraphDefinition;
use conductor_core::config::ApiKeyRole;
use conductor_core::error::ConductorError;
use conductor_core::feedback::FeedbackSubmission;
use conductor_core::types::ExecutionId;

use crate::auth;
use crate::connection;
use crate::middleware::Authenticated;
use crate::state::AppState;

/// Error response: status code plus `{"error": message}`.
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn forbidden() -> Self {
        Self(StatusCode::FORBIDDEN, "insufficient role".into())
    }
}

impl From<ConductorError> for ApiError {
    fn from(e: ConductorError) -> Self {
        let status = match &e {
            e if e.is_definition_error() => StatusCode::UNPROCESSABLE_ENTITY,
            ConductorError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            ConductorError::InvalidFeedback(_) => StatusCode::BAD_REQUEST,
            ConductorError::NotResumable { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %e, "Request failed");
        }
        Self(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn check(role: ApiKeyRole, allowed: fn(ApiKeyRole) -> bool) -> Result<(), ApiError> {
    if allowed(role) {
        Ok(())
    } else {
        Err(ApiError::forbidden())
    }
}

// GET /api/health: no auth required
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /api/executions: requires Operator+
pub async fn submit_execution(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(definition): Json<GraphDefinition>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    check(auth_result.role, auth::has_operator_access)?;
    let graph_id = definition.id.clone();
    let execution_id = state.orchestrator.submit_graph(definition).await?;
    info!(execution_id = %execution_id, graph_id = %graph_id, caller = %auth_result.name, "Execution accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "execution_id": execution_id })),
    ))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/executions?limit=50: requires Viewer+
pub async fn list_executions(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult {
    check(auth_result.role, auth::has_viewer_access)?;
    let records = state.orchestrator.list_executions(q.limit).await?;
    let summaries: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "execution_id": r.execution_id,
                "graph_id": r.graph_id,
                "founder_id": r.founder_id,
                "status": r.status,
                "created_at": r.created_at,
                "finished_at": r.finished_at,
            })
        })
        .collect();
    Ok(Json(json!({ "executions": summaries })))
}

// GET /api/executions/:id: requires Viewer+
pub async fn execution_status(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    check(auth_result.role, auth::has_viewer_access)?;
    let record = state
        .orchestrator
        .get_execution_status(&ExecutionId::from_string(&id))
        .await?;
    Ok(Json(json!(record)))
}

// POST /api/executions/:id/cancel: requires Operator+
pub async fn cancel_execution(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    check(auth_result.role, auth::has_operator_access)?;
    let cancelled = state
        .orchestrator
        .cancel_execution(&ExecutionId::from_string(&id))
        .await?;
    Ok(Json(json!({ "execution_id": id, "cancelled": cancelled })))
}

// POST /api/executions/:id/feedback: requires Operator+
pub async fn submit_feedback(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(submission): Json<FeedbackSubmission>,
) -> ApiResult {
    check(auth_result.role, auth::has_operator_access)?;
    let inserted = state
        .orchestrator
        .submit_feedback(&ExecutionId::from_string(&id), submission)
        .await?;
    Ok(Json(json!({ "execution_id": id, "inserted": inserted })))
}

// GET /api/capabilities: requires Viewer+
pub async fn list_capabilities(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult {
    check(auth_result.role, auth::has_viewer_access)?;
    Ok(Json(json!({ "capabilities": state.orchestrator.capabilities() })))
}

// GET /api/founders/:id/preferences: requires Viewer+
pub async fn founder_preferences(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(founder_id): Path<String>,
) -> ApiResult {
    check(auth_result.role, auth::has_viewer_access)?;
    let preferences = state.orchestrator.preferences(&founder_id).await?;
    Ok(Json(json!({ "founder_id": founder_id, "preferences": preferences })))
}

// POST /api/founders/:id/preferences/refresh: requires Admin
pub async fn refresh_preferences(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(founder_id): Path<String>,
) -> ApiResult {
    check(auth_result.role, auth::has_admin_access)?;
    let preferences = state.orchestrator.refresh_preferences(&founder_id).await?;
    Ok(Json(json!({ "founder_id": founder_id, "preferences": preferences })))
}

// GET /ws: WebSocket upgrade, requires auth
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, auth_result.role))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, role: ApiKeyRole) {
    info!("WebSocket client connected");
    connection::handle_connection(socket, state.orchestrator.clone(), role).await;
    debug!("WebSocket client disconnected");
}
