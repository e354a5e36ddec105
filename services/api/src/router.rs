//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        Answer, CreateAnswerPayload, CreateSessionPayload, ErrorResponse, OrchestratePayload,
        SequenceReply, Session, SessionStatus, UpdateSessionStatusPayload,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, patch, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_session,
        handlers::list_sessions,
        handlers::get_session,
        handlers::update_session_status,
        handlers::orchestrate,
        handlers::create_answer,
        handlers::list_answers,
    ),
    components(
        schemas(
            Session,
            Answer,
            CreateSessionPayload,
            UpdateSessionStatusPayload,
            OrchestratePayload,
            CreateAnswerPayload,
            SequenceReply,
            ErrorResponse,
            SessionStatus
        )
    ),
    tags(
        (name = "Rehearsal API", description = "Sessions, sequencing and answers for interview rehearsal")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route("/sessions/{id}", get(handlers::get_session))
        .route(
            "/sessions/{id}/status",
            patch(handlers::update_session_status),
        )
        .route(
            "/sessions/{id}/answers",
            get(handlers::list_answers).post(handlers::create_answer),
        )
        .route("/engine/orchestrate", post(handlers::orchestrate))
        .route("/ws", get(ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&str> = doc.paths.paths.keys().map(String::as_str).collect();

        for expected in [
            "/sessions",
            "/sessions/{id}",
            "/sessions/{id}/status",
            "/sessions/{id}/answers",
            "/engine/orchestrate",
        ] {
            assert!(paths.contains(&expected), "missing {expected}");
        }
    }
}
