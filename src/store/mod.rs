//! Job store: the single source of truth for orchestration state.
//!
//! Every mutation goes through [`JobStore::update`], which is guarded by the
//! caller's expected prior status. Two orchestration attempts racing on the
//! same job cannot both progress it: the loser gets
//! [`OrchestratorError::Conflict`].
//!
//! - [`InMemoryJobStore`]: non-durable, lost on restart
//! - [`SqliteJobStore`]: durable, survives restart

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobStatus, RuntimeKind};

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Selection criteria for [`JobStore::list`]. Empty filter matches all jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub runtime: Option<RuntimeKind>,
    /// Only jobs whose last write happened before this instant
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.runtime.map_or(true, |r| job.runtime == r)
            && self.updated_before.map_or(true, |t| job.updated_at < t)
    }
}

pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `Duplicate` if its idempotency key is taken.
    fn create(&self, job: Job) -> Result<Job>;

    fn get(&self, id: Uuid) -> Result<Option<Job>>;

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>>;

    /// Atomically apply `mutation` if the job is still in `expected`.
    fn update(&self, id: Uuid, expected: JobStatus, mutation: &dyn Fn(&mut Job)) -> Result<Job>;

    /// Matching jobs in creation order.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Remove terminal jobs last written before `before`. Returns the count removed.
    fn evict_finished(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Cheap reachability probe for health reporting.
    fn ping(&self) -> Result<()>;

    fn is_durable(&self) -> bool;
}

/// Open the store described by `config`.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn JobStore>> {
    match &config.db_path {
        Some(path) => {
            let store = SqliteJobStore::open(path, config.max_jobs)?;
            tracing::info!(path = %path.display(), "Opened durable job store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No database path configured; job store is in-memory and NOT durable");
            Ok(Arc::new(InMemoryJobStore::with_capacity(config.max_jobs)))
        }
    }
}

/// Shared guarded-update logic for every store implementation.
pub(crate) fn apply_update(
    current: &Job,
    expected: JobStatus,
    mutation: &dyn Fn(&mut Job),
) -> Result<Job> {
    if current.status != expected {
        return Err(OrchestratorError::Conflict {
            job_id: current.id,
            expected,
            actual: current.status,
        });
    }

    let mut next = current.clone();
    mutation(&mut next);

    if current.status.is_terminal()
        || (next.status != current.status && !current.status.can_transition_to(next.status))
    {
        return Err(OrchestratorError::InvalidTransition {
            job_id: current.id,
            from: current.status,
            to: next.status,
        });
    }

    // Identity fields are immutable
    next.id = current.id;
    next.idempotency_key = current.idempotency_key.clone();
    next.created_at = current.created_at;
    next.version = current.version + 1;
    next.updated_at = Utc::now();
    Ok(next)
}
