//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for session
//! management, sequencing and answer storage. It uses `utoipa` doc comments to
//! generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    models::{
        Answer, CreateAnswerPayload, CreateSessionPayload, ErrorResponse, OrchestratePayload,
        SequenceReply, Session, UpdateSessionStatusPayload,
    },
    orchestrator::OrchestrateError,
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn user_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("x-user-id header is required".to_string()))
}

fn session_not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("Session with id '{}' not found", id))
}

/// Create a new interview session.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = CreateSessionPayload,
    responses(
        (status = 201, description = "Session created successfully", body = Session),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the candidate creating the session")
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;
    let session = state.db.create_session(user_id, &payload).await?;
    info!(session_id = %session.id, user_id, "Session created");
    Ok((StatusCode::CREATED, Json(session)))
}

/// List all sessions for a candidate.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "List of sessions", body = [Session]),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the candidate")
    )
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Session>>, ApiError> {
    let user_id = user_id(&headers)?;
    let sessions = state.db.list_sessions(user_id).await?;
    Ok(Json(sessions))
}

/// Get a specific session by its ID.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = Session),
        (status = 404, description = "Session not found"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the candidate")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;

    let session = state
        .db
        .get_session(id, user_id)
        .await?
        .ok_or_else(|| session_not_found(id))?;

    Ok((StatusCode::OK, Json(session)))
}

/// Update the status of a session.
#[utoipa::path(
    patch,
    path = "/sessions/{id}/status",
    request_body = UpdateSessionStatusPayload,
    responses(
        (status = 200, description = "Session status updated successfully", body = Session),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Status would move backwards", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the candidate")
    )
)]
pub async fn update_session_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateSessionStatusPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;

    // First, ensure the session exists and belongs to the candidate.
    let session = state
        .db
        .get_session(id, user_id)
        .await?
        .ok_or_else(|| session_not_found(id))?;

    if !session.status.can_transition_to(payload.status) {
        return Err(ApiError::Conflict(format!(
            "Session '{}' cannot move from {} to {}",
            id, session.status, payload.status
        )));
    }

    let updated_session = state.db.update_session_status(id, payload.status).await?;

    Ok((StatusCode::OK, Json(updated_session)))
}

/// Compute the next question sequence for a session.
///
/// The first call for a fresh session returns the forced opener (`INIT_Q1`);
/// later calls return the assigned sequence (`INIT_SEQUENCE`).
#[utoipa::path(
    post,
    path = "/engine/orchestrate",
    request_body = OrchestratePayload,
    responses(
        (status = 200, description = "Sequencing result", body = SequenceReply),
        (status = 400, description = "session_id missing", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn orchestrate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OrchestratePayload>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = payload
        .session_id
        .ok_or_else(|| ApiError::BadRequest("session_id is required".to_string()))?;

    let response = state
        .orchestrator
        .orchestrate(session_id)
        .await
        .map_err(|e| match e {
            OrchestrateError::SessionNotFound(id) => session_not_found(id),
            OrchestrateError::Storage(err) => ApiError::InternalServerError(err),
        })?;

    Ok((StatusCode::OK, Json(response)))
}

/// Record the answer to one question of a session.
#[utoipa::path(
    post,
    path = "/sessions/{id}/answers",
    request_body = CreateAnswerPayload,
    responses(
        (status = 201, description = "Answer recorded", body = Answer),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Question already answered", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the candidate")
    )
)]
pub async fn create_answer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<CreateAnswerPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;

    let _ = state
        .db
        .get_session(id, user_id)
        .await?
        .ok_or_else(|| session_not_found(id))?;

    let question_id = payload.question_id.clone();
    let record = payload.into_record(id, user_id);
    let answer = state.db.insert_answer(&record).await?.ok_or_else(|| {
        ApiError::Conflict(format!(
            "Question '{}' already has an answer in session '{}'",
            question_id, id
        ))
    })?;

    Ok((StatusCode::CREATED, Json(answer)))
}

/// List the answers recorded for a session.
#[utoipa::path(
    get,
    path = "/sessions/{id}/answers",
    responses(
        (status = 200, description = "Recorded answers", body = [Answer]),
        (status = 404, description = "Session not found"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the candidate")
    )
)]
pub async fn list_answers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Answer>>, ApiError> {
    let user_id = user_id(&headers)?;

    let _ = state
        .db
        .get_session(id, user_id)
        .await?
        .ok_or_else(|| session_not_found(id))?;

    Ok(Json(state.db.list_answers(id).await?))
}
