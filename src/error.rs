use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// A single field-level validation failure on an inbound trigger event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl FieldError {
    pub fn new(field: &str, kind: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            kind: kind.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Request validation failed: {}", summarize(.0))]
    Validation(Vec<FieldError>),

    #[error("Duplicate event: idempotency key {key} already created job {job_id}")]
    Duplicate { key: String, job_id: Uuid },

    #[error("Conflict on job {job_id}: expected {expected}, found {actual}")]
    Conflict {
        job_id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job store is at capacity")]
    QueueFull,

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("No {0} runtime slot became available before the deadline")]
    PoolExhausted(String),

    #[error("Workload exceeded wall-clock limit of {0}s")]
    TimedOut(u64),

    #[error("Workload exceeded resource limit: {0}")]
    ResourceExceeded(String),

    #[error("Crash recovery could not reconcile job {job_id}: {reason}")]
    CrashRecovery { job_id: Uuid, reason: String },

    #[error("Job {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(err: rusqlite::Error) -> Self {
        OrchestratorError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Store(format!("serialization: {}", err))
    }
}

impl OrchestratorError {
    /// Transient resource errors are retried locally before a job is failed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Mount(_)
                | OrchestratorError::PoolExhausted(_)
                | OrchestratorError::Conflict { .. }
        )
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
