//! Control API
//!
//! JSON over HTTP mirroring the orchestrator commands. Errors carry an
//! [`ApiError`] body whose `kind` fixes the status code.

use super::health::ServerState;
use crate::controller::OrchestratorError;
use crate::error::{ApiError, ErrorKind};
use crate::model::{RolloutPlan, RolloutState};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, warn};

pub fn routes() -> Router<ServerState> {
    Router::new()
        .route("/api/v1/rollouts", post(start).get(list))
        .route("/api/v1/rollouts/{id}", get(status))
        .route("/api/v1/rollouts/{id}/pause", post(pause))
        .route("/api/v1/rollouts/{id}/resume", post(resume))
        .route("/api/v1/rollouts/{id}/abort", post(abort))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn rejected(command: &str, err: OrchestratorError) -> ApiError {
    warn!(command = command, kind = %err.kind(), error = %err, "Command rejected");
    err.into()
}

/// `POST /api/v1/rollouts`
///
/// The body is parsed here rather than by the `Json` extractor so a
/// malformed plan gets the same error shape as an invalid one.
async fn start(
    State(state): State<ServerState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<RolloutState>)> {
    let plan: RolloutPlan = serde_json::from_slice(&body).map_err(|e| ApiError {
        kind: ErrorKind::PlanValidation,
        message: format!("malformed plan: {e}"),
    })?;

    let rollout = state
        .orchestrator
        .start(plan)
        .await
        .map_err(|e| rejected("start", e))?;
    info!(rollout = ?rollout.id, phase = %rollout.phase, "Rollout started");
    Ok((StatusCode::CREATED, Json(rollout)))
}

/// `GET /api/v1/rollouts`
async fn list(State(state): State<ServerState>) -> Json<Vec<RolloutState>> {
    Json(state.orchestrator.list().await)
}

/// `GET /api/v1/rollouts/{id}`
async fn status(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RolloutState>> {
    state
        .orchestrator
        .status(&id)
        .await
        .map(Json)
        .map_err(Into::into)
}

async fn pause(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RolloutState>> {
    state
        .orchestrator
        .pause(&id)
        .await
        .map(Json)
        .map_err(|e| rejected("pause", e))
}

async fn resume(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RolloutState>> {
    state
        .orchestrator
        .resume(&id)
        .await
        .map(Json)
        .map_err(|e| rejected("resume", e))
}

async fn abort(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RolloutState>> {
    state
        .orchestrator
        .abort(&id)
        .await
        .map(Json)
        .map_err(|e| rejected("abort", e))
}
