use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobStatus};
use crate::store::{apply_update, JobFilter, JobStore};

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    by_key: HashMap<String, Uuid>,
}

/// In-memory job store.
///
/// Not durable: every record is lost when the process exits. Use
/// [`SqliteJobStore`](crate::store::SqliteJobStore) when jobs must survive a restart.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    max_jobs: usize,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_jobs,
        }
    }

    /// Returns the current number of jobs held
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> OrchestratorError {
        OrchestratorError::Store("in-memory store lock poisoned".to_string())
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: Job) -> Result<Job> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        if let Some(existing) = inner.by_key.get(&job.idempotency_key) {
            return Err(OrchestratorError::Duplicate {
                key: job.idempotency_key.clone(),
                job_id: *existing,
            });
        }
        if inner.jobs.len() >= self.max_jobs {
            return Err(OrchestratorError::QueueFull);
        }
        inner.by_key.insert(job.idempotency_key.clone(), job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.jobs.get(&id).cloned())
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner
            .by_key
            .get(key)
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    fn update(&self, id: Uuid, expected: JobStatus, mutation: &dyn Fn(&mut Job)) -> Result<Job> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let current = inner
            .jobs
            .get(&id)
            .ok_or(OrchestratorError::JobNotFound(id))?;
        let next = apply_update(current, expected, mutation)?;
        inner.jobs.insert(id, next.clone());
        Ok(next)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    fn evict_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let evicted: Vec<(Uuid, String)> = inner
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.updated_at < before)
            .map(|j| (j.id, j.idempotency_key.clone()))
            .collect();
        for (id, key) in &evicted {
            inner.jobs.remove(id);
            inner.by_key.remove(key);
        }
        Ok(evicted.len())
    }

    fn ping(&self) -> Result<()> {
        self.inner.read().map(|_| ()).map_err(|_| Self::poisoned())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
