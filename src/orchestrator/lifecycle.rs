//! Per-job state machine: `Received -> Mounting -> Running -> terminal`.
//!
//! The machine runs in its own task. The worker that spawned it owns the
//! cleanup: whatever the task returns, including a panic, the sandbox is
//! unmounted before the terminal state is recorded. Runtime slots are
//! returned by dropping their handles, which also happens on unwind.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::job::{FailureReason, Job, JobResult, JobStatus, RuntimeKind, WorkloadStep};
use crate::orchestrator::Orchestrator;
use crate::runtime::{ExecutionOutcome, RuntimeHandle};
use crate::sandbox::Sandbox;

const RESULT_DIR: &str = ".ssqe";
const ARTIFACT_DIR: &str = "artifacts";
const MAX_ARTIFACTS: usize = 1_000;
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

/// Where a live mount is parked so cleanup can reach it even if the task
/// driving the job dies.
type SandboxSlot = Arc<Mutex<Option<Sandbox>>>;

/// How a job's run ended, as seen by the task driving it.
#[derive(Debug)]
enum Completion {
    /// Record a terminal state; `from` is the status the job must still be in
    Finish {
        from: JobStatus,
        status: JobStatus,
        reason: Option<FailureReason>,
        error: Option<String>,
        result: Option<JobResult>,
    },
    /// Leave the stored record alone
    Abandon(&'static str),
}

impl Completion {
    fn succeeded(result: JobResult) -> Self {
        Completion::Finish {
            from: JobStatus::Running,
            status: JobStatus::Succeeded,
            reason: None,
            error: None,
            result: Some(result),
        }
    }

    fn failed(
        from: JobStatus,
        status: JobStatus,
        reason: FailureReason,
        error: impl Into<String>,
        result: Option<JobResult>,
    ) -> Self {
        Completion::Finish {
            from,
            status,
            reason: Some(reason),
            error: Some(error.into()),
            result,
        }
    }
}

enum AcquireError {
    Cancelled,
    Failed(OrchestratorError),
}

impl Orchestrator {
    /// Drive one queued job to completion and clean up after it.
    pub(crate) async fn process(&self, id: Uuid) {
        let Some(token) = self.inner.active.register(id, &self.inner.halt) else {
            tracing::debug!(job_id = %id, "Job already running here, skipping");
            return;
        };
        let span = tracing::info_span!("job", job_id = %id);
        let slot: SandboxSlot = Arc::new(Mutex::new(None));

        let beat_stop = CancellationToken::new();
        let this = self.clone();
        let stop = beat_stop.clone();
        let beat =
            tokio::spawn(async move { this.heartbeat(id, stop).await }.instrument(span.clone()));

        let this = self.clone();
        let drive_slot = slot.clone();
        let joined = tokio::spawn(
            async move { this.drive(id, token, drive_slot).await }.instrument(span.clone()),
        )
        .await;
        beat_stop.cancel();
        let _ = beat.await;

        async {
            let sandbox = match slot.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(sandbox) = sandbox {
                if let Err(e) = self.inner.sandbox.unmount(sandbox).await {
                    tracing::error!(error = %e, "Cleanup could not unmount sandbox");
                }
            }

            match joined {
                Ok(completion @ Completion::Finish { .. }) => self.record(id, completion),
                Ok(Completion::Abandon(why)) => {
                    tracing::debug!(why, "Job abandoned without a state change");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Orchestration task failed");
                    self.fail_after_fault(id, &format!("orchestration task failed: {}", e));
                }
            }
        }
        .instrument(span)
        .await;

        self.inner.active.remove(id);
    }

    /// Keep `updated_at` fresh while the job is mid-flight, so neither a
    /// sweep nor a health check elsewhere takes it for an abandoned run.
    async fn heartbeat(&self, id: Uuid, stop: CancellationToken) {
        let every = (self.inner.config.recovery.staleness_threshold() / 3)
            .max(MIN_HEARTBEAT_INTERVAL);
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
            }
            let status = match self.inner.store.get(id) {
                Ok(Some(job)) if job.status.is_in_flight() => job.status,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Heartbeat could not load job");
                    continue;
                }
            };
            // Changes nothing but the version and updated_at
            if let Err(e) = self.inner.store.update(id, status, &|_| {}) {
                tracing::debug!(error = %e, "Heartbeat skipped");
            }
        }
    }

    async fn drive(&self, id: Uuid, token: CancellationToken, slot: SandboxSlot) -> Completion {
        let job = match self.inner.store.get(id) {
            Ok(Some(job)) => job,
            Ok(None) => return Completion::Abandon("job no longer exists"),
            Err(e) => {
                tracing::error!(error = %e, "Could not load job");
                return Completion::Abandon("store unavailable");
            }
        };
        if job.status != JobStatus::Received {
            return Completion::Abandon("job is no longer waiting to start");
        }
        if token.is_cancelled() {
            return self.interrupted(id, JobStatus::Received, None);
        }

        // Received -> Mounting
        let mount_point = self.inner.sandbox.mount_point_for(&job);
        let job = match self.inner.store.update(id, JobStatus::Received, &|j| {
            j.transition(JobStatus::Mounting);
            j.sandbox_path = Some(mount_point.clone());
        }) {
            Ok(job) => job,
            Err(e) => {
                tracing::debug!(error = %e, "Lost the race to start job");
                return Completion::Abandon("another actor moved the job first");
            }
        };
        tracing::info!(status = %job.status, retry_count = job.retry_count, "Mounting sandbox");

        let workdir = match self.inner.sandbox.mount_cancellable(&job, &token).await {
            Ok(sandbox) => {
                let workdir = sandbox.mount_point.clone();
                match slot.lock() {
                    Ok(mut guard) => *guard = Some(sandbox),
                    Err(poisoned) => *poisoned.into_inner() = Some(sandbox),
                }
                workdir
            }
            Err(OrchestratorError::Cancelled(_)) => {
                return self.interrupted(id, JobStatus::Mounting, None)
            }
            Err(e) => {
                return Completion::failed(
                    JobStatus::Mounting,
                    JobStatus::Failed,
                    FailureReason::MountError,
                    e.to_string(),
                    None,
                )
            }
        };
        if token.is_cancelled() {
            return self.interrupted(id, JobStatus::Mounting, None);
        }

        // Mounting -> Running
        let job = match self
            .inner
            .store
            .update(id, JobStatus::Mounting, &|j| j.transition(JobStatus::Running))
        {
            Ok(job) => job,
            Err(e) => {
                tracing::debug!(error = %e, "Job changed while mounting");
                return Completion::Abandon("job changed while mounting");
            }
        };
        tracing::info!(status = %job.status, "Job running");

        self.run_steps(&job, &workdir, &token).await
    }

    /// Execute the job's steps in order, one runtime slot at a time. The
    /// wall-clock limit covers the whole job, not each step.
    async fn run_steps(&self, job: &Job, workdir: &Path, token: &CancellationToken) -> Completion {
        let steps = if job.steps.is_empty() {
            vec![WorkloadStep::new(job.runtime, Vec::new())]
        } else {
            job.steps.clone()
        };
        let started = Instant::now();
        let budget = job.limits.wall_clock();
        let mut result = JobResult::default();

        for (index, step) in steps.iter().enumerate() {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Completion::failed(
                    JobStatus::Running,
                    JobStatus::TimedOut,
                    FailureReason::TimedOut,
                    OrchestratorError::TimedOut(budget.as_secs()).to_string(),
                    Some(result),
                );
            }
            let limits = job.limits.clone().with_wall_clock(remaining);

            let mut handle = match self.acquire_slot(step.runtime, token).await {
                Ok(handle) => handle,
                Err(AcquireError::Cancelled) => {
                    return self.interrupted(job.id, JobStatus::Running, Some(result))
                }
                Err(AcquireError::Failed(e)) => {
                    let reason = match e {
                        OrchestratorError::PoolExhausted(_) => FailureReason::PoolExhausted,
                        _ => FailureReason::Internal,
                    };
                    return Completion::failed(
                        JobStatus::Running,
                        JobStatus::Failed,
                        reason,
                        e.to_string(),
                        Some(result),
                    );
                }
            };

            tracing::info!(step = index, runtime = %step.runtime, "Executing step");
            let executed = self
                .inner
                .pool
                .execute(&mut handle, &step.args, workdir, &limits, token)
                .await;
            self.inner.pool.release(handle);

            let outcome = match executed {
                Ok(outcome) => outcome,
                Err(e) => {
                    return Completion::failed(
                        JobStatus::Running,
                        JobStatus::Failed,
                        FailureReason::SpawnFailed,
                        format!("step {} ({}) could not start: {}", index, step.runtime, e),
                        Some(result),
                    )
                }
            };

            result = step_result(job.id, index, &outcome, workdir).await;
            result.duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                ExecutionOutcome::Completed(output) if output.exit_code == Some(0) => {
                    tracing::info!(step = index, "Step succeeded");
                }
                ExecutionOutcome::Completed(output) => {
                    let how = match (output.exit_code, output.signal) {
                        (Some(code), _) => format!("exited with code {}", code),
                        (None, Some(signal)) => format!("was killed by signal {}", signal),
                        (None, None) => "ended without an exit status".to_string(),
                    };
                    return Completion::failed(
                        JobStatus::Running,
                        JobStatus::Failed,
                        FailureReason::NonZeroExit,
                        format!("step {} ({}) {}", index, step.runtime, how),
                        Some(result),
                    );
                }
                ExecutionOutcome::TimedOut(_) => {
                    return Completion::failed(
                        JobStatus::Running,
                        JobStatus::TimedOut,
                        FailureReason::TimedOut,
                        OrchestratorError::TimedOut(budget.as_secs()).to_string(),
                        Some(result),
                    )
                }
                ExecutionOutcome::ResourceExceeded { resource, .. } => {
                    return Completion::failed(
                        JobStatus::Running,
                        JobStatus::Failed,
                        FailureReason::ResourceExceeded,
                        OrchestratorError::ResourceExceeded(resource).to_string(),
                        Some(result),
                    )
                }
                ExecutionOutcome::Cancelled(_) => {
                    return self.interrupted(job.id, JobStatus::Running, Some(result))
                }
            }
        }

        result.artifacts = list_artifacts(workdir).await;
        Completion::succeeded(result)
    }

    /// Reserve a slot, backing off while the pool stays exhausted, until the
    /// configured retry deadline.
    async fn acquire_slot(
        &self,
        kind: RuntimeKind,
        token: &CancellationToken,
    ) -> std::result::Result<RuntimeHandle, AcquireError> {
        let pool_config = &self.inner.config.pool;
        let deadline = Instant::now() + pool_config.retry_deadline();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let wait = pool_config
                .acquire_timeout()
                .min(deadline.saturating_duration_since(Instant::now()));
            let acquired = tokio::select! {
                acquired = self.inner.pool.acquire(kind, wait) => acquired,
                _ = token.cancelled() => return Err(AcquireError::Cancelled),
            };

            match acquired {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_transient() => {
                    let delay = self.inner.config.retry.delay(attempt);
                    if Instant::now() + delay >= deadline {
                        tracing::warn!(runtime = %kind, attempt, "Runtime pool retry deadline passed");
                        return Err(AcquireError::Failed(e));
                    }
                    tracing::warn!(
                        runtime = %kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Runtime pool exhausted, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(AcquireError::Cancelled),
                    }
                }
                Err(e) => return Err(AcquireError::Failed(e)),
            }
        }
    }

    /// The job's token fired. A cancel request fails the job; a halting
    /// orchestrator leaves it for the recovery sweep.
    fn interrupted(&self, id: Uuid, from: JobStatus, result: Option<JobResult>) -> Completion {
        if self.inner.halt.is_cancelled() {
            return Completion::Abandon("orchestrator halted");
        }
        Completion::failed(
            from,
            JobStatus::Failed,
            FailureReason::Cancelled,
            OrchestratorError::Cancelled(id).to_string(),
            result,
        )
    }

    fn record(&self, id: Uuid, completion: Completion) {
        let Completion::Finish {
            from,
            status,
            reason,
            error,
            result,
        } = completion
        else {
            return;
        };

        let written = self.update_retrying(id, from, &|j| {
            j.transition(status);
            j.reason = reason;
            j.error = error.clone();
            if result.is_some() {
                j.result = result.clone();
            }
        });
        match written {
            Ok(job) => tracing::info!(
                status = %job.status,
                reason = job.reason.map(|r| r.as_str()),
                error = job.error.as_deref(),
                "Job finished"
            ),
            Err(e) => tracing::warn!(error = %e, intended = %status, "Could not record job outcome"),
        }
    }

    /// Terminal-fail a job whose driving task died unexpectedly.
    fn fail_after_fault(&self, id: Uuid, message: &str) {
        let current = match self.inner.store.get(id) {
            Ok(Some(job)) if !job.status.is_terminal() => job,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(error = %e, "Could not load job after fault");
                return;
            }
        };
        if let Err(e) = self.update_retrying(id, current.status, &|j| {
            j.fail(JobStatus::Failed, FailureReason::Internal, message)
        }) {
            tracing::error!(error = %e, "Could not fail job after fault");
        }
    }
}

/// Build the result for one step and write its full captured output into
/// the sandbox, when the sandbox is writable.
async fn step_result(
    job_id: Uuid,
    index: usize,
    outcome: &ExecutionOutcome,
    workdir: &Path,
) -> JobResult {
    let output = outcome.output();
    let dir = PathBuf::from(RESULT_DIR).join(job_id.to_string());
    let stdout_ref = dir.join(format!("step-{}.stdout", index));
    let stderr_ref = dir.join(format!("step-{}.stderr", index));

    let written = async {
        tokio::fs::create_dir_all(workdir.join(&dir)).await?;
        tokio::fs::write(workdir.join(&stdout_ref), output.stdout.as_bytes()).await?;
        tokio::fs::write(workdir.join(&stderr_ref), output.stderr.as_bytes()).await?;
        Ok::<(), std::io::Error>(())
    }
    .await;
    let (stdout_ref, stderr_ref) = match written {
        Ok(()) => (Some(stdout_ref), Some(stderr_ref)),
        Err(e) => {
            tracing::debug!(error = %e, "Sandbox not writable, output kept inline only");
            (None, None)
        }
    };

    JobResult {
        exit_code: output.exit_code,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
        output_truncated: output.truncated,
        stdout_ref,
        stderr_ref,
        artifacts: Vec::new(),
        step: index,
        duration_ms: output.duration.as_millis() as u64,
    }
}

/// Files under `artifacts/` in the sandbox, relative to the sandbox root.
async fn list_artifacts(workdir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![workdir.join(ARTIFACT_DIR)];

    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => pending.push(path),
                Ok(ft) if ft.is_file() => {
                    if let Ok(relative) = path.strip_prefix(workdir) {
                        found.push(relative.to_path_buf());
                    }
                }
                _ => {}
            }
            if found.len() >= MAX_ARTIFACTS {
                tracing::warn!(limit = MAX_ARTIFACTS, "Artifact listing truncated");
                found.sort();
                return found;
            }
        }
    }

    found.sort();
    found
}
