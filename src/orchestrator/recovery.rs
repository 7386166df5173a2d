//! Crash recovery and retention.
//!
//! A sweep runs once at startup and then on a fixed interval. It:
//! 1. Finds jobs stuck in `Mounting`/`Running` past the staleness threshold
//!    that no worker in this process owns, releases their mounts, and either
//!    re-drives them through `Received` or fails them once the retry budget
//!    is spent
//! 2. Re-enqueues `Received` jobs that are not queued (queue was full, or
//!    the process restarted before pickup)
//! 3. Evicts terminal jobs older than the retention window

use chrono::Utc;

use crate::error::{OrchestratorError, Result};
use crate::job::{FailureReason, Job, JobStatus};
use crate::orchestrator::Orchestrator;
use crate::store::JobFilter;

/// What a single sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub redriven: usize,
    pub failed: usize,
    pub requeued: usize,
    pub evicted: usize,
}

enum Reconciled {
    Redriven,
    Failed,
    Skipped,
}

impl Orchestrator {
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();
        let threshold = chrono::Duration::milliseconds(
            self.inner.config.recovery.staleness_threshold_ms as i64,
        );

        for status in [JobStatus::Mounting, JobStatus::Running] {
            let filter = JobFilter {
                status: Some(status),
                updated_before: Some(now - threshold),
                ..Default::default()
            };
            for job in self.inner.store.list(&filter)? {
                if self.inner.active.is_running(job.id) || !job.is_stale(threshold, now) {
                    continue;
                }
                match self.reconcile(&job).await {
                    Reconciled::Redriven => report.redriven += 1,
                    Reconciled::Failed => report.failed += 1,
                    Reconciled::Skipped => {}
                }
            }
        }

        for job in self.inner.store.list(&JobFilter::with_status(JobStatus::Received))? {
            if self.inner.active.is_tracked(job.id) {
                continue;
            }
            if self.enqueue(job.id) {
                report.requeued += 1;
            }
        }

        let retention = chrono::Duration::milliseconds(self.inner.config.recovery.retention_ms as i64);
        report.evicted = self.inner.store.evict_finished(now - retention)?;

        if report != SweepReport::default() {
            tracing::info!(
                redriven = report.redriven,
                failed = report.failed,
                requeued = report.requeued,
                evicted = report.evicted,
                "Recovery sweep acted"
            );
        }
        Ok(report)
    }

    /// Clean up after a stale job, then re-drive or fail it.
    async fn reconcile(&self, job: &Job) -> Reconciled {
        let budget = self.inner.config.recovery.retry_budget;
        tracing::warn!(
            job_id = %job.id,
            status = %job.status,
            retry_count = job.retry_count,
            updated_at = %job.updated_at,
            "Found stale job"
        );

        let cleanup = match &job.sandbox_path {
            Some(path) => self.inner.sandbox.release_stale(path).await,
            None => Ok(()),
        };

        let outcome = match cleanup {
            Err(e) => {
                let err = OrchestratorError::CrashRecovery {
                    job_id: job.id,
                    reason: format!("mount cleanup failed: {}", e),
                };
                tracing::error!(job_id = %job.id, error = %err, "Stale job could not be reconciled");
                self.inner.store.update(job.id, job.status, &|j| {
                    j.fail(JobStatus::Failed, FailureReason::CrashRecovery, err.to_string())
                })
            }
            Ok(()) if job.retry_count >= budget => {
                let err = OrchestratorError::CrashRecovery {
                    job_id: job.id,
                    reason: format!("retry budget of {} exhausted", budget),
                };
                self.inner.store.update(job.id, job.status, &|j| {
                    j.fail(JobStatus::Failed, FailureReason::CrashRecovery, err.to_string())
                })
            }
            Ok(()) => self.inner.store.update(job.id, job.status, &|j| {
                j.transition(JobStatus::Received);
                j.retry_count += 1;
                j.sandbox_path = None;
                j.result = None;
            }),
        };

        match outcome {
            Ok(updated) if updated.status == JobStatus::Received => {
                tracing::info!(
                    job_id = %job.id,
                    retry_count = updated.retry_count,
                    "Re-driving stale job"
                );
                self.enqueue(job.id);
                Reconciled::Redriven
            }
            Ok(updated) => {
                tracing::warn!(job_id = %job.id, error = updated.error.as_deref(), "Stale job failed");
                Reconciled::Failed
            }
            // Someone else moved it since we listed it
            Err(e) => {
                tracing::debug!(job_id = %job.id, error = %e, "Stale job changed during sweep");
                Reconciled::Skipped
            }
        }
    }
}
