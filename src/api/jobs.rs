use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{FieldError, OrchestratorError, Result};
use crate::job::{Job, JobStatus, RuntimeKind};
use crate::store::JobFilter;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    runtime: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct JobListResponse {
    jobs: Vec<Job>,
    total: usize,
}

#[derive(Serialize)]
struct CancelResponse {
    job_id: Uuid,
    status: JobStatus,
    /// True once the job is recorded as cancelled; false while its worker
    /// is still stopping it
    cancelled: bool,
}

pub async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    let mut errors = Vec::new();
    let status = match query.status.as_deref().map(str::parse::<JobStatus>) {
        Some(Err(msg)) => {
            errors.push(FieldError::new("status", "enum", msg));
            None
        }
        Some(Ok(status)) => Some(status),
        None => None,
    };
    let runtime = match query.runtime.as_deref().map(str::parse::<RuntimeKind>) {
        Some(Err(msg)) => {
            errors.push(FieldError::new("runtime", "enum", msg));
            None
        }
        Some(Ok(runtime)) => Some(runtime),
        None => None,
    };
    if !errors.is_empty() {
        return Err(OrchestratorError::Validation(errors));
    }

    let filter = JobFilter {
        status,
        runtime,
        limit: query.limit,
        ..Default::default()
    };
    let jobs = state.orchestrator.store().list(&filter)?;
    Ok(Json(JobListResponse {
        total: jobs.len(),
        jobs,
    }))
}

pub async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>> {
    let id = parse_id(&id)?;
    state
        .orchestrator
        .store()
        .get(id)?
        .map(Json)
        .ok_or(OrchestratorError::JobNotFound(id))
}

pub async fn cancel_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = parse_id(&id)?;
    let job = state.orchestrator.cancel(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id: job.id,
            status: job.status,
            cancelled: job.status.is_terminal(),
        }),
    ))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| {
        OrchestratorError::Validation(vec![FieldError::new(
            "id",
            "uuid_parsing",
            "job id must be a UUID",
        )])
    })
}
