use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{FieldError, OrchestratorError};
use crate::job::TriggerEvent;

pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Serialize)]
struct AcceptedResponse {
    status: &'static str,
    job_id: Uuid,
    job_status: String,
}

/// Accept a trigger event. Validates, persists a `Received` job and queues
/// it; never waits for the job to run.
pub async fn receive_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(expected) = &state.webhook_secret {
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            tracing::warn!("Webhook rejected: missing or wrong secret");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "status": "error",
                    "code": "UNAUTHORIZED",
                    "message": "Invalid webhook secret",
                })),
            )
                .into_response();
        }
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return OrchestratorError::Validation(vec![FieldError::new(
                "body",
                "json_invalid",
                format!("request body is not valid JSON: {}", e),
            )])
            .into_response()
        }
    };

    let event = match TriggerEvent::parse(&value) {
        Ok(event) => event,
        Err(errors) => {
            tracing::info!(errors = errors.len(), "Webhook payload rejected");
            return OrchestratorError::Validation(errors).into_response();
        }
    };

    match state.orchestrator.submit(event) {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse {
                status: "accepted",
                job_id: job.id,
                job_status: job.status.to_string(),
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
