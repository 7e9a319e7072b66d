use crate::config::{AppState, ServerConfig};
use crate::websocket;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use trellis_core::error::{GateError, RunError, ScheduleError};

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;
    state.start();

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        // Workflows: ingestion, versions, triggers
        .route("/api/workflows", get(handlers::list_workflows))
        .route("/api/workflows", post(handlers::publish_workflow))
        .route("/api/workflows/{workflow_id}/trigger", post(handlers::set_trigger))
        // Runs: control and history
        .route("/api/runs", get(handlers::list_runs))
        .route("/api/runs", post(handlers::start_run))
        .route("/api/runs/{run_id}", get(handlers::get_run))
        .route("/api/runs/{run_id}/cancel", post(handlers::cancel_run))
        .route("/api/runs/{run_id}/events", get(handlers::get_run_events))
        // Approvals
        .route("/api/approvals", get(handlers::list_approvals))
        .route("/api/approvals/{gate_id}/decision", post(handlers::record_decision))
        // External event sources
        .route("/api/events/{source_id}", post(handlers::notify_event))
        // Live event feed
        .route("/ws", get(websocket::ws_handler))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "trellis",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }
}

/// Custom error type for API handlers. Typed engine errors map to
/// meaningful status codes; everything else is a 500.
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        if let Some(e) = self.0.downcast_ref::<RunError>() {
            return match e {
                RunError::NotFound(_) | RunError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
                RunError::NotCancellable(_) => StatusCode::CONFLICT,
                RunError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if let Some(e) = self.0.downcast_ref::<GateError>() {
            return match e {
                GateError::NotFound(_) => StatusCode::NOT_FOUND,
                GateError::AlreadyDecided(_) => StatusCode::CONFLICT,
                GateError::PendingDecision => StatusCode::UNPROCESSABLE_ENTITY,
                GateError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if self.0.downcast_ref::<ScheduleError>().is_some() {
            return StatusCode::UNPROCESSABLE_ENTITY;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let response = ErrorResponse::new(self.0.to_string());
        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
