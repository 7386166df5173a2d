//! Shared setup for integration tests: a local directory-backed mount driver
//! and `sh` standing in for every runtime, so jobs run on any POSIX host.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use ssqe_orchestrator::config::{
    MountDriverKind, OrchestratorConfig, PoolConfig, RetryPolicy, RuntimeSpec, SandboxConfig,
    StoreConfig,
};
use ssqe_orchestrator::error::{OrchestratorError, Result};
use ssqe_orchestrator::job::{Job, RuntimeKind, TriggerEvent};
use ssqe_orchestrator::orchestrator::Orchestrator;
use ssqe_orchestrator::runtime::ResourceLimits;
use ssqe_orchestrator::sandbox::{InputRef, LocalMountDriver, MountDriver};

pub const INPUT_REF: &str = "gs://qe-bucket/suite";
pub const WAIT: Duration = Duration::from_secs(15);

pub fn sh_pool(slots: usize) -> PoolConfig {
    PoolConfig {
        runtimes: vec![
            RuntimeSpec::new(RuntimeKind::Jvm, "sh", &["-c", "exit 0"], slots),
            RuntimeSpec::new(RuntimeKind::Node, "sh", &["-c", "exit 0"], slots),
            RuntimeSpec::new(RuntimeKind::Python, "sh", &["-c", "exit 0"], slots),
        ],
        acquire_timeout_ms: 200,
        retry_deadline_ms: 2_000,
        default_limits: ResourceLimits::default().with_wall_clock(Duration::from_secs(20)),
        ..PoolConfig::default()
    }
}

pub fn test_config(dir: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new("127.0.0.1:0".parse().unwrap());
    config.workers = 2;
    config.queue_capacity = 16;
    config.shutdown_grace_ms = 2_000;
    config.store = StoreConfig::in_memory();
    config.sandbox = SandboxConfig {
        mount_root: dir.join("mounts"),
        driver: MountDriverKind::Local,
        local_bucket_root: dir.join("buckets"),
        mount_timeout_ms: 2_000,
        mount_attempts: 2,
        ..SandboxConfig::default()
    };
    config.pool = sh_pool(2);
    config.retry = RetryPolicy::immediate();
    config
}

/// Directory the local driver maps `INPUT_REF` onto.
pub fn bucket_dir(dir: &Path) -> PathBuf {
    dir.join("buckets").join("qe-bucket").join("suite")
}

pub async fn start(config: OrchestratorConfig) -> Orchestrator {
    let orchestrator = Orchestrator::from_config(config).unwrap();
    orchestrator.start().await.unwrap();
    orchestrator
}

pub async fn started_in(dir: &TempDir) -> Orchestrator {
    start(test_config(dir.path())).await
}

pub fn payload(key: &str, script: &str) -> Value {
    json!({
        "source": "ci",
        "idempotency_key": key,
        "job_kind": "Python",
        "input_ref": INPUT_REF,
        "args": ["-c", script],
    })
}

pub fn event(key: &str, script: &str) -> TriggerEvent {
    TriggerEvent::parse(&payload(key, script)).unwrap()
}

pub fn event_from(value: Value) -> TriggerEvent {
    TriggerEvent::parse(&value).unwrap()
}

pub async fn wait_for_status(
    orchestrator: &Orchestrator,
    id: uuid::Uuid,
    status: ssqe_orchestrator::job::JobStatus,
) -> Job {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let job = orchestrator.store().get(id).unwrap().unwrap();
        if job.status == status {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            id,
            job.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Local driver that counts calls, and can be told to fail mounts.
pub struct CountingDriver {
    inner: LocalMountDriver,
    pub fail_mounts: bool,
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
}

impl CountingDriver {
    pub fn new(root: impl Into<PathBuf>, fail_mounts: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalMountDriver::new(root),
            fail_mounts,
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
        })
    }

    pub fn mounts(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmounts(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MountDriver for CountingDriver {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn mount(&self, source: &InputRef, mount_point: &Path) -> Result<()> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_mounts {
            return Err(OrchestratorError::Mount("bucket unreachable".to_string()));
        }
        self.inner.mount(source, mount_point).await
    }

    async fn is_ready(&self, mount_point: &Path) -> bool {
        self.inner.is_ready(mount_point).await
    }

    async fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        self.inner.unmount(mount_point).await
    }

    async fn probe(&self) -> Result<()> {
        if self.fail_mounts {
            return Err(OrchestratorError::Mount("driver offline".to_string()));
        }
        Ok(())
    }
}
