//! Readiness reporting.
//!
//! `ready` needs a reachable store. A mount driver that cannot mount, or a
//! saturated pool while jobs sit stuck past the staleness threshold, makes
//! the service `degraded`. Jobs a worker here is driving are never stuck. The whole evaluation is bounded by the configured
//! health timeout.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde::Serialize;

use crate::api::AppState;
use crate::error::{OrchestratorError, Result};
use crate::job::JobStatus;
use crate::orchestrator::Orchestrator;
use crate::store::JobFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ready,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reason: &'static str,
    pub free_slots: usize,
    pub active_jobs: usize,
    pub stuck_jobs: usize,
    pub active_mounts: usize,
    pub queue_depth: usize,
}

impl HealthReport {
    fn unavailable(reason: &'static str) -> Self {
        Self {
            status: HealthStatus::Unavailable,
            reason,
            free_slots: 0,
            active_jobs: 0,
            stuck_jobs: 0,
            active_mounts: 0,
            queue_depth: 0,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self.status {
            HealthStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            HealthStatus::Ready | HealthStatus::Degraded => StatusCode::OK,
        }
    }
}

/// Evaluate health, giving up after the configured health timeout.
pub async fn check(orchestrator: &Orchestrator) -> HealthReport {
    let timeout = orchestrator.config().health_timeout();
    match tokio::time::timeout(timeout, evaluate(orchestrator)).await {
        Ok(report) => report,
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Health check timed out");
            HealthReport::unavailable("health_check_timeout")
        }
    }
}

async fn evaluate(orchestrator: &Orchestrator) -> HealthReport {
    let this = orchestrator.clone();
    let threshold = orchestrator.config().recovery.staleness_threshold_ms;

    // Store calls block; keep them off the async workers so the timeout holds
    let stuck = tokio::task::spawn_blocking(move || -> Result<usize> {
        this.store().ping()?;
        count_stuck(&this, threshold)
    })
    .await
    .map_err(|e| OrchestratorError::Internal(e.to_string()))
    .and_then(|r| r);

    let stuck_jobs = match stuck {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "Health check: store unreachable");
            return HealthReport::unavailable("store_unreachable");
        }
    };

    let mut report = HealthReport {
        status: HealthStatus::Ready,
        reason: "ok",
        free_slots: orchestrator.pool().free_slots(),
        active_jobs: orchestrator.active_jobs(),
        stuck_jobs,
        active_mounts: orchestrator.sandbox().active_mounts(),
        queue_depth: orchestrator.queue_depth(),
    };

    if let Err(e) = orchestrator.sandbox().probe().await {
        tracing::warn!(error = %e, "Health check: mount driver unavailable");
        report.status = HealthStatus::Degraded;
        report.reason = "mount_driver_unavailable";
    } else if report.free_slots == 0 && report.stuck_jobs > 0 {
        report.status = HealthStatus::Degraded;
        report.reason = "pool_saturated_with_stuck_jobs";
    }
    report
}

fn count_stuck(orchestrator: &Orchestrator, threshold_ms: u64) -> Result<usize> {
    let now = Utc::now();
    let threshold = chrono::Duration::milliseconds(threshold_ms as i64);
    let mut stuck = 0;
    for status in [JobStatus::Mounting, JobStatus::Running] {
        let filter = JobFilter {
            status: Some(status),
            updated_before: Some(now - threshold),
            ..Default::default()
        };
        stuck += orchestrator
            .store()
            .list(&filter)?
            .iter()
            .filter(|job| !orchestrator.is_running_here(job.id))
            .count();
    }
    Ok(stuck)
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = check(&state.orchestrator).await;
    (report.http_status(), Json(report))
}

