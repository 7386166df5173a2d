//! Orchestrator core.
//!
//! Accepted jobs go into a bounded work queue consumed by a fixed set of
//! workers. Each worker drives one job at a time through
//! `Received -> Mounting -> Running -> terminal`, and always releases the
//! job's sandbox and runtime slot on the way out, whatever the exit path.
//!
//! - [`ActiveJobs`]: which jobs this process owns, and their cancel tokens
//! - [`lifecycle`]: the per-job state machine
//! - [`recovery`]: stale-job sweep, re-enqueue and retention

pub mod lifecycle;
pub mod recovery;
pub mod registry;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::{FailureReason, Job, JobStatus, TriggerEvent};
use crate::runtime::RuntimePool;
use crate::sandbox::SandboxAdapter;
use crate::store::{self, JobStore};

pub use recovery::SweepReport;
pub use registry::ActiveJobs;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HALT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    pool: Arc<RuntimePool>,
    sandbox: Arc<SandboxAdapter>,
    queue_tx: mpsc::Sender<Uuid>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<Uuid>>,
    active: ActiveJobs,
    /// Workers stop taking queue items once this fires
    stopping: CancellationToken,
    /// Hard stop: every in-flight job is interrupted and left for recovery
    halt: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to the orchestration engine. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        pool: Arc<RuntimePool>,
        sandbox: Arc<SandboxAdapter>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                pool,
                sandbox,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                active: ActiveJobs::new(),
                stopping: CancellationToken::new(),
                halt: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build every component from configuration.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let store = store::open(&config.store)?;
        let pool = Arc::new(RuntimePool::new(&config.pool));
        let sandbox = Arc::new(SandboxAdapter::new(&config.sandbox, config.retry.clone()));
        Ok(Self::new(config, store, pool, sandbox))
    }

    /// Run the startup recovery sweep, then spawn the workers and the
    /// periodic sweep.
    pub async fn start(&self) -> Result<()> {
        let report = self.sweep().await?;
        tracing::info!(
            redriven = report.redriven,
            failed = report.failed,
            requeued = report.requeued,
            evicted = report.evicted,
            "Startup recovery sweep complete"
        );

        let mut tasks = self
            .inner
            .tasks
            .lock()
            .map_err(|_| OrchestratorError::Internal("task list lock poisoned".to_string()))?;
        for worker_id in 0..self.inner.config.workers.max(1) {
            let this = self.clone();
            tasks.push(tokio::spawn(async move { this.worker_loop(worker_id).await }));
        }
        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.sweep_loop().await }));

        tracing::info!(
            workers = self.inner.config.workers.max(1),
            queue_capacity = self.inner.config.queue_capacity,
            runtime_slots = self.inner.pool.capacity(),
            mount_driver = self.inner.sandbox.driver_name(),
            durable = self.inner.store.is_durable(),
            "Orchestrator started"
        );
        Ok(())
    }

    /// Accept a validated trigger event. Never waits for the job to run.
    pub fn submit(&self, event: TriggerEvent) -> Result<Job> {
        if let Some(existing) = self.inner.store.find_by_idempotency_key(&event.idempotency_key)? {
            return Err(OrchestratorError::Duplicate {
                key: event.idempotency_key,
                job_id: existing.id,
            });
        }

        let pool = &self.inner.config.pool;
        let job = self
            .inner
            .store
            .create(event.into_job(&pool.default_limits, &pool.max_limits))?;
        tracing::info!(
            job_id = %job.id,
            source = %job.source,
            runtime = %job.runtime,
            input_ref = %job.input_ref,
            "Job received"
        );

        self.enqueue(job.id);
        Ok(job)
    }

    /// Put a `Received` job on the work queue. A full queue leaves it in the
    /// store for the next sweep to pick up.
    pub(crate) fn enqueue(&self, id: Uuid) -> bool {
        if !self.inner.active.mark_pending(id) {
            return true;
        }
        match self.inner.queue_tx.try_send(id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.active.unmark_pending(id);
                tracing::warn!(job_id = %id, "Work queue full, job left for the recovery sweep");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.active.unmark_pending(id);
                tracing::warn!(job_id = %id, "Work queue closed");
                false
            }
        }
    }

    /// Cancel a job in any non-terminal state.
    ///
    /// A job running here is interrupted and recorded as cancelled by its
    /// worker; otherwise the store record is failed directly.
    pub async fn cancel(&self, id: Uuid) -> Result<Job> {
        let job = self
            .inner
            .store
            .get(id)?
            .ok_or(OrchestratorError::JobNotFound(id))?;
        if job.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                job_id: id,
                from: job.status,
                to: JobStatus::Failed,
            });
        }

        if self.inner.active.cancel(id) {
            tracing::info!(job_id = %id, status = %job.status, "Cancellation signalled to worker");
            return Ok(job);
        }

        let cancelled = self.update_retrying(id, job.status, &|j| {
            j.fail(JobStatus::Failed, FailureReason::Cancelled, "cancelled by request")
        })?;
        // A worker may have picked the job up in the meantime
        self.inner.active.cancel(id);
        // Not running here, so any mount it had belongs to a dead run
        if let Some(path) = &job.sandbox_path {
            if let Err(e) = self.inner.sandbox.release_stale(path).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to release mount of cancelled job");
            }
        }
        tracing::info!(job_id = %id, "Job cancelled");
        Ok(cancelled)
    }

    /// Stop taking work, let in-flight jobs finish for up to `shutdown_grace`,
    /// then interrupt whatever is left. Interrupted jobs keep their stored
    /// state and are picked up by the next start's recovery sweep.
    pub async fn shutdown(&self) {
        tracing::info!(
            in_flight = self.inner.active.running(),
            "Orchestrator shutting down"
        );
        self.inner.stopping.cancel();

        let drained = tokio::time::timeout(self.inner.config.shutdown_grace(), self.drain()).await;
        if drained.is_err() {
            tracing::warn!(
                in_flight = self.inner.active.running(),
                "Grace period elapsed, interrupting in-flight jobs"
            );
            self.inner.halt.cancel();
            let _ = tokio::time::timeout(HALT_DRAIN_TIMEOUT, self.drain()).await;
        }

        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for mut task in tasks {
            if tokio::time::timeout(HALT_DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
        tracing::info!("Orchestrator stopped");
    }

    async fn drain(&self) {
        while self.inner.active.running() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Poll the store until `id` reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: Uuid, timeout: Duration) -> Result<Job> {
        let wait = async {
            loop {
                match self.inner.store.get(id)? {
                    Some(job) if job.status.is_terminal() => return Ok(job),
                    Some(_) => tokio::time::sleep(Duration::from_millis(25)).await,
                    None => return Err(OrchestratorError::JobNotFound(id)),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| OrchestratorError::Internal(format!("job {} still running", id)))?
    }

    async fn worker_loop(self, worker_id: usize) {
        tracing::debug!(worker_id, "Worker started");
        loop {
            let next = {
                let mut rx = self.inner.queue_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.inner.stopping.cancelled() => None,
                    id = rx.recv() => id,
                }
            };
            let Some(id) = next else { break };
            self.process(id).await;
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    async fn sweep_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.recovery.sweep_interval());
        // The first tick completes immediately; startup already swept
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Recovery sweep failed");
                    }
                }
                _ = self.inner.stopping.cancelled() => break,
            }
        }
    }

    /// Guarded update that absorbs optimistic-concurrency conflicts by
    /// re-reading and retrying against the status actually stored.
    pub(crate) fn update_retrying(
        &self,
        id: Uuid,
        expected: JobStatus,
        mutation: &dyn Fn(&mut Job),
    ) -> Result<Job> {
        let mut expected = expected;
        for _ in 0..3 {
            match self.inner.store.update(id, expected, mutation) {
                Err(OrchestratorError::Conflict { actual, .. }) => {
                    tracing::debug!(job_id = %id, %expected, %actual, "Update conflict, retrying");
                    expected = actual;
                }
                other => return other,
            }
        }
        self.inner.store.update(id, expected, mutation)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn pool(&self) -> &Arc<RuntimePool> {
        &self.inner.pool
    }

    pub fn sandbox(&self) -> &Arc<SandboxAdapter> {
        &self.inner.sandbox
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.active.running()
    }

    pub fn is_running_here(&self, id: Uuid) -> bool {
        self.inner.active.is_running(id)
    }

    /// Items waiting in the work queue.
    pub fn queue_depth(&self) -> usize {
        self.inner.config.queue_capacity.max(1) - self.inner.queue_tx.capacity()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.is_cancelled()
    }
}
