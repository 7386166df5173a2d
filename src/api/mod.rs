//! HTTP surface: webhook ingress, job status and cancellation, health.

pub mod health;
pub mod jobs;
pub mod webhook;

use std::net::SocketAddr;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Required `X-Webhook-Secret` value, if any
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let webhook_secret = orchestrator.config().webhook_secret.clone();
        Self {
            orchestrator,
            webhook_secret,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/webhook", post(webhook::receive_handler))
        .route("/events", post(webhook::receive_handler))
        .route("/jobs", get(jobs::list_handler))
        .route("/jobs/:id", get(jobs::get_handler))
        .route("/jobs/:id/cancel", post(jobs::cancel_handler))
        .route("/health", get(health::health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP listener");
        OrchestratorError::Io(e)
    })?;
    tracing::info!(addr = %addr, "HTTP listener bound");
    Ok(listener)
}

/// Serve until `shutdown` fires, then finish in-flight requests and return.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("HTTP server stopped");
    Ok(())
}

async fn index_handler() -> impl IntoResponse {
    Json(json!({
        "service": "ssqe-orchestrator",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            OrchestratorError::Validation(details) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "status": "error",
                        "code": "VALIDATION_ERROR",
                        "message": "Request validation failed",
                        "details": details,
                    })),
                )
                    .into_response();
            }
            OrchestratorError::Duplicate { job_id, .. } => {
                return (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "status": "error",
                        "code": "DUPLICATE_EVENT",
                        "message": self.to_string(),
                        "job_id": job_id,
                    })),
                )
                    .into_response();
            }
            OrchestratorError::JobNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            OrchestratorError::InvalidTransition { .. } | OrchestratorError::Conflict { .. } => {
                (StatusCode::CONFLICT, "CONFLICT")
            }
            OrchestratorError::QueueFull => (StatusCode::SERVICE_UNAVAILABLE, "CAPACITY_EXCEEDED"),
            OrchestratorError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            Json(json!({
                "status": "error",
                "code": code,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
