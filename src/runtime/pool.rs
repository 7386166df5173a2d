use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{PoolConfig, RuntimeSpec};
use crate::error::{OrchestratorError, Result};
use crate::job::RuntimeKind;
use crate::runtime::executor::{run_subprocess, ExecutionOutcome};
use crate::runtime::ResourceLimits;

/// An execution runtime the orchestrator can hand a workload to.
///
/// The orchestrator only ever talks to this interface; how a JVM, Node or
/// Python workload is actually launched stays inside the implementation.
#[async_trait]
pub trait Runtime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    async fn execute(
        &self,
        args: &[String],
        workdir: &Path,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> std::io::Result<ExecutionOutcome>;
}

/// Runtime backed by an executable on PATH.
#[derive(Debug, Clone)]
pub struct SubprocessRuntime {
    kind: RuntimeKind,
    program: String,
    default_args: Vec<String>,
    max_output_bytes: usize,
}

impl SubprocessRuntime {
    pub fn new(spec: &RuntimeSpec, max_output_bytes: usize) -> Self {
        Self {
            kind: spec.kind,
            program: spec.program.clone(),
            default_args: spec.default_args.clone(),
            max_output_bytes,
        }
    }

    /// Environment that makes each runtime respect the job's limits.
    fn environment(&self, workdir: &Path, limits: &ResourceLimits) -> Vec<(String, String)> {
        let mut env = vec![(
            "SSQE_SANDBOX".to_string(),
            workdir.display().to_string(),
        )];
        let memory_mb = limits.memory_bytes.map(|b| (b / (1024 * 1024)).max(16));
        match self.kind {
            RuntimeKind::Jvm => {
                if let Some(mb) = memory_mb {
                    // Leave headroom for metaspace and thread stacks
                    env.push(("JAVA_TOOL_OPTIONS".to_string(), format!("-Xmx{}m", mb * 3 / 4)));
                }
            }
            RuntimeKind::Node => {
                if let Some(mb) = memory_mb {
                    env.push((
                        "NODE_OPTIONS".to_string(),
                        format!("--max-old-space-size={}", mb * 3 / 4),
                    ));
                }
            }
            RuntimeKind::Python => {
                env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
                env.push(("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()));
            }
            RuntimeKind::Mixed => {}
        }
        env
    }
}

#[async_trait]
impl Runtime for SubprocessRuntime {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn execute(
        &self,
        args: &[String],
        workdir: &Path,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> std::io::Result<ExecutionOutcome> {
        let args = if args.is_empty() {
            &self.default_args
        } else {
            args
        };
        let env = self.environment(workdir, limits);
        run_subprocess(
            &self.program,
            args,
            workdir,
            &env,
            limits,
            self.max_output_bytes,
            cancel,
        )
        .await
    }
}

/// A reserved pool slot. Dropping the handle returns the slot.
pub struct RuntimeHandle {
    pub id: Uuid,
    pub kind: RuntimeKind,
    pub workdir: Option<PathBuf>,
    pub limits: Option<ResourceLimits>,
    pub acquired_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    runtime: Arc<dyn Runtime>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("workdir", &self.workdir)
            .field("started_at", &self.started_at)
            .finish()
    }
}

struct Slot {
    runtime: Arc<dyn Runtime>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Bounded set of execution slots, one counting semaphore per runtime kind.
pub struct RuntimePool {
    slots: HashMap<RuntimeKind, Slot>,
}

impl RuntimePool {
    /// Pool with a [`SubprocessRuntime`] for every configured kind.
    pub fn new(config: &PoolConfig) -> Self {
        let pool = Self {
            slots: HashMap::new(),
        };
        config.runtimes.iter().fold(pool, |pool, spec| {
            let runtime = Arc::new(SubprocessRuntime::new(spec, config.max_output_bytes));
            pool.with_runtime(runtime, spec.slots)
        })
    }

    pub fn empty() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Register (or replace) the runtime serving `runtime.kind()`.
    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>, slots: usize) -> Self {
        let slots = slots.max(1);
        self.slots.insert(
            runtime.kind(),
            Slot {
                runtime,
                semaphore: Arc::new(Semaphore::new(slots)),
                capacity: slots,
            },
        );
        self
    }

    /// Reserve a slot, waiting at most `timeout` for one to free up.
    pub async fn acquire(&self, kind: RuntimeKind, timeout: Duration) -> Result<RuntimeHandle> {
        let slot = self.slots.get(&kind).ok_or_else(|| {
            OrchestratorError::Internal(format!("no runtime configured for {}", kind))
        })?;

        let permit = match tokio::time::timeout(timeout, slot.semaphore.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(OrchestratorError::Internal(format!(
                    "{} runtime pool is closed",
                    kind
                )))
            }
            Err(_) => return Err(OrchestratorError::PoolExhausted(kind.to_string())),
        };

        let handle = RuntimeHandle {
            id: Uuid::new_v4(),
            kind,
            workdir: None,
            limits: None,
            acquired_at: Utc::now(),
            started_at: None,
            finished_at: None,
            runtime: slot.runtime.clone(),
            _permit: permit,
        };
        tracing::debug!(handle_id = %handle.id, runtime = %kind, "Runtime slot acquired");
        Ok(handle)
    }

    /// Run a workload on an acquired handle.
    pub async fn execute(
        &self,
        handle: &mut RuntimeHandle,
        args: &[String],
        workdir: &Path,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        handle.workdir = Some(workdir.to_path_buf());
        handle.limits = Some(limits.clone());
        handle.started_at = Some(Utc::now());
        let started = Instant::now();

        let result = handle.runtime.execute(args, workdir, limits, cancel).await;
        handle.finished_at = Some(Utc::now());

        tracing::debug!(
            handle_id = %handle.id,
            runtime = %handle.kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Runtime execution returned"
        );
        result.map_err(OrchestratorError::Io)
    }

    /// Return the slot. Dropping the handle has the same effect.
    pub fn release(&self, handle: RuntimeHandle) {
        tracing::debug!(handle_id = %handle.id, runtime = %handle.kind, "Runtime slot released");
        drop(handle);
    }

    pub fn kinds(&self) -> Vec<RuntimeKind> {
        self.slots.keys().copied().collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.values().map(|s| s.capacity).sum()
    }

    pub fn free_slots(&self) -> usize {
        self.slots
            .values()
            .map(|s| s.semaphore.available_permits())
            .sum()
    }

    pub fn free_slots_for(&self, kind: RuntimeKind) -> usize {
        self.slots
            .get(&kind)
            .map(|s| s.semaphore.available_permits())
            .unwrap_or(0)
    }
}
