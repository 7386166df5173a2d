use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::job::RuntimeKind;
use crate::runtime::ResourceLimits;

/// How job sandboxes are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountDriverKind {
    /// Mount the bucket with `gcsfuse`, release with `fusermount -u`.
    Fuse,
    /// Map `bucket/prefix` onto a directory under `local_bucket_root`.
    Local,
}

/// Configuration for per-job sandbox mounts.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory under which every job gets its own mount point
    pub mount_root: PathBuf,
    pub driver: MountDriverKind,
    /// Backing directory for the local driver (one sub-directory per bucket)
    pub local_bucket_root: PathBuf,
    /// FUSE mount helper
    pub fuse_binary: String,
    /// FUSE unmount helper
    pub unmount_binary: String,
    /// How long a single mount attempt may take to become ready
    pub mount_timeout_ms: u64,
    /// Total mount attempts before the job is failed
    pub mount_attempts: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/tmp/ssqe/mounts"),
            driver: MountDriverKind::Fuse,
            local_bucket_root: PathBuf::from("/tmp/ssqe/buckets"),
            fuse_binary: "gcsfuse".to_string(),
            unmount_binary: "fusermount".to_string(),
            mount_timeout_ms: 30_000,
            mount_attempts: 3,
        }
    }
}

impl SandboxConfig {
    pub fn mount_timeout(&self) -> Duration {
        Duration::from_millis(self.mount_timeout_ms)
    }
}

/// One executable runtime the pool can hand out.
#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    pub kind: RuntimeKind,
    /// Executable looked up on PATH (or an absolute path)
    pub program: String,
    /// Arguments used when the trigger event supplies none
    pub default_args: Vec<String>,
    /// Concurrent executions allowed for this kind
    pub slots: usize,
}

impl RuntimeSpec {
    pub fn new(kind: RuntimeKind, program: &str, default_args: &[&str], slots: usize) -> Self {
        Self {
            kind,
            program: program.to_string(),
            default_args: default_args.iter().map(|a| a.to_string()).collect(),
            slots,
        }
    }
}

/// Configuration for the runtime pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub runtimes: Vec<RuntimeSpec>,
    /// Single `acquire` wait before `PoolExhausted`
    pub acquire_timeout_ms: u64,
    /// Overall deadline across acquire retries before the job fails
    pub retry_deadline_ms: u64,
    /// Limits applied when the trigger event does not override them
    pub default_limits: ResourceLimits,
    /// Upper bound for any per-job override
    pub max_limits: ResourceLimits,
    /// Captured bytes kept per stream
    pub max_output_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            runtimes: vec![
                RuntimeSpec::new(RuntimeKind::Jvm, "java", &["-jar", "app.jar"], 2),
                RuntimeSpec::new(RuntimeKind::Node, "node", &["index.js"], 2),
                RuntimeSpec::new(RuntimeKind::Python, "python3", &["main.py"], 2),
            ],
            acquire_timeout_ms: 30_000,
            retry_deadline_ms: 300_000,
            default_limits: ResourceLimits::default(),
            max_limits: ResourceLimits {
                wall_clock_ms: 3_600_000,
                memory_bytes: Some(8 * 1024 * 1024 * 1024),
                cpu_secs: Some(7_200),
            },
            max_output_bytes: 64 * 1024,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn retry_deadline(&self) -> Duration {
        Duration::from_millis(self.retry_deadline_ms)
    }

    pub fn runtime(&self, kind: RuntimeKind) -> Option<&RuntimeSpec> {
        self.runtimes.iter().find(|r| r.kind == kind)
    }

    /// Replace the executable for one kind, keeping its other settings.
    pub fn with_program(mut self, kind: RuntimeKind, program: &str) -> Self {
        if let Some(spec) = self.runtimes.iter_mut().find(|r| r.kind == kind) {
            spec.program = program.to_string();
        }
        self
    }
}

/// Exponential backoff used for transient mount and pool failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
    /// Add up to 20% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2,
            jitter: true,
        }
    }
}

/// Crash-recovery and retention policy.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// A job in `Mounting`/`Running` untouched for this long is stale
    pub staleness_threshold_ms: u64,
    /// Re-drives allowed before a stale job is forced to `Failed`
    pub retry_budget: u32,
    pub sweep_interval_ms: u64,
    /// Terminal jobs older than this are evicted from the store
    pub retention_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_ms: 30 * 60 * 1000,
            retry_budget: 2,
            sweep_interval_ms: 60_000,
            retention_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

impl RecoveryConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Where job records live. `None` keeps them in memory only.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub db_path: Option<PathBuf>,
    pub max_jobs: usize,
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            db_path: None,
            max_jobs: 10_000,
        }
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            max_jobs: 10_000,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.db_path.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub listen_addr: SocketAddr,
    /// Orchestration workers consuming the job queue
    pub workers: usize,
    pub queue_capacity: usize,
    /// Required `X-Webhook-Secret` value, if set
    pub webhook_secret: Option<String>,
    pub health_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub store: StoreConfig,
    pub sandbox: SandboxConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub recovery: RecoveryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:8080"
                .parse()
                .expect("default listen address is valid"),
            workers: 4,
            queue_capacity: 256,
            webhook_secret: None,
            health_timeout_ms: 10_000,
            shutdown_grace_ms: 30_000,
            store: StoreConfig::in_memory(),
            sandbox: SandboxConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
