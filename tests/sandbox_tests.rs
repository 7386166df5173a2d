mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use ssqe_orchestrator::config::{MountDriverKind, RetryPolicy, SandboxConfig};
use ssqe_orchestrator::error::{OrchestratorError, Result};
use ssqe_orchestrator::job::{Job, RuntimeKind, WorkloadStep};
use ssqe_orchestrator::runtime::ResourceLimits;
use ssqe_orchestrator::sandbox::{InputRef, MountDriver, MountStatus, SandboxAdapter};

use common::{CountingDriver, INPUT_REF};

fn sandbox_config(dir: &Path) -> SandboxConfig {
    SandboxConfig {
        mount_root: dir.join("mounts"),
        driver: MountDriverKind::Local,
        local_bucket_root: dir.join("buckets"),
        mount_timeout_ms: 200,
        mount_attempts: 2,
        ..SandboxConfig::default()
    }
}

fn job(input_ref: &str) -> Job {
    Job::new(
        "ci".to_string(),
        uuid::Uuid::new_v4().to_string(),
        RuntimeKind::Python,
        input_ref.to_string(),
        vec![WorkloadStep::new(RuntimeKind::Python, vec![])],
        ResourceLimits::default(),
        Map::new(),
    )
}

#[tokio::test]
async fn test_mount_then_unmount_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let driver = CountingDriver::new(dir.path().join("buckets"), false);
    let adapter =
        SandboxAdapter::with_driver(driver.clone(), &sandbox_config(dir.path()), RetryPolicy::immediate());
    let job = job(INPUT_REF);

    let sandbox = adapter.mount(&job).await.unwrap();
    assert_eq!(sandbox.status, MountStatus::Mounted);
    assert_eq!(sandbox.job_id, job.id);
    assert_eq!(sandbox.mount_point, adapter.mount_point_for(&job));
    assert!(sandbox.path().is_dir());
    assert_eq!(adapter.active_mounts(), 1);

    // Read/write/list through the mount
    std::fs::write(sandbox.path().join("input.txt"), b"data").unwrap();
    let listed: Vec<_> = std::fs::read_dir(sandbox.path()).unwrap().collect();
    assert_eq!(listed.len(), 1);

    let mount_point = sandbox.mount_point.clone();
    adapter.unmount(sandbox).await.unwrap();
    assert!(!mount_point.exists());
    assert_eq!(adapter.active_mounts(), 0);
    assert_eq!(driver.mounts(), 1);
    assert_eq!(driver.unmounts(), 1);
    assert_eq!(adapter.counters(), (1, 1));
}

#[tokio::test]
async fn test_mount_point_is_never_shared() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = SandboxAdapter::new(&sandbox_config(dir.path()), RetryPolicy::immediate());
    let job = job(INPUT_REF);

    let first = adapter.mount(&job).await.unwrap();
    let err = adapter.mount(&job).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Mount(_)));
    assert_eq!(adapter.active_mounts(), 1);

    // Another job on the same bucket gets its own mount point
    let other = job_with_same_input(&job);
    let second = adapter.mount(&other).await.unwrap();
    assert_ne!(first.mount_point, second.mount_point);

    adapter.unmount(first).await.unwrap();
    adapter.unmount(second).await.unwrap();
    // Released mount points can be reused by the same attempt
    let again = adapter.mount(&job).await.unwrap();
    adapter.unmount(again).await.unwrap();
}

fn job_with_same_input(job: &Job) -> Job {
    self::job(&job.input_ref)
}

#[tokio::test]
async fn test_redriven_job_gets_a_fresh_mount_point() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = SandboxAdapter::new(&sandbox_config(dir.path()), RetryPolicy::immediate());
    let mut job = job(INPUT_REF);

    let first = adapter.mount_point_for(&job);
    job.retry_count += 1;
    let second = adapter.mount_point_for(&job);
    assert_ne!(first, second);
    assert!(second.to_string_lossy().ends_with(&format!("{}-1", job.id)));
}

#[tokio::test]
async fn test_invalid_input_ref_is_a_mount_error() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = SandboxAdapter::new(&sandbox_config(dir.path()), RetryPolicy::immediate());

    let err = adapter.mount(&job("s3://bucket/x")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Mount(_)));
    assert_eq!(adapter.active_mounts(), 0);
}

/// Mounts "succeed" but never become ready.
struct NeverReady {
    unmounts: AtomicUsize,
}

#[async_trait]
impl MountDriver for NeverReady {
    fn name(&self) -> &'static str {
        "never-ready"
    }

    async fn mount(&self, _source: &InputRef, _mount_point: &Path) -> Result<()> {
        Ok(())
    }

    async fn is_ready(&self, _mount_point: &Path) -> bool {
        false
    }

    async fn unmount(&self, _mount_point: &Path) -> Result<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_mount_times_out_and_cleans_up_each_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(NeverReady {
        unmounts: AtomicUsize::new(0),
    });
    let config = sandbox_config(dir.path());
    let adapter = SandboxAdapter::with_driver(driver.clone(), &config, RetryPolicy::immediate());

    let started = Instant::now();
    let err = adapter.mount(&job(INPUT_REF)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Mount(_)));
    assert!(err.to_string().contains("giving up after 2 attempts"));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(driver.unmounts.load(Ordering::SeqCst), 2);
    assert_eq!(adapter.active_mounts(), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_pending_mount() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(NeverReady {
        unmounts: AtomicUsize::new(0),
    });
    let config = SandboxConfig {
        mount_timeout_ms: 30_000,
        mount_attempts: 3,
        ..sandbox_config(dir.path())
    };
    let adapter = SandboxAdapter::with_driver(driver.clone(), &config, RetryPolicy::immediate());
    let job = job(INPUT_REF);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = adapter.mount_cancellable(&job, &cancel).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled(id) if id == job.id));
    assert!(started.elapsed() < Duration::from_secs(2));
    // Torn down and the mount point is free for the next attempt
    assert_eq!(driver.unmounts.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.active_mounts(), 0);
    assert!(!adapter.is_active(&adapter.mount_point_for(&job)));
}

#[tokio::test]
async fn test_release_stale_skips_live_mounts_and_clears_leftovers() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = SandboxAdapter::new(&sandbox_config(dir.path()), RetryPolicy::immediate());
    let job = job(INPUT_REF);

    let live = adapter.mount(&job).await.unwrap();
    assert!(adapter.release_stale(&live.mount_point).await.is_err());
    assert!(live.mount_point.exists());

    // A mount point left behind by a previous process
    let leftover = dir.path().join("mounts").join("dead-0");
    std::fs::create_dir_all(leftover.join("partial")).unwrap();
    adapter.release_stale(&leftover).await.unwrap();
    assert!(!leftover.exists());

    // Nothing there is fine too
    adapter.release_stale(&leftover).await.unwrap();
    adapter.unmount(live).await.unwrap();
}

#[tokio::test]
async fn test_probe_reports_driver_availability() {
    let dir = tempfile::tempdir().unwrap();
    let ok = SandboxAdapter::new(&sandbox_config(dir.path()), RetryPolicy::immediate());
    assert!(ok.probe().await.is_ok());
    assert_eq!(ok.driver_name(), "local");

    let offline = SandboxAdapter::with_driver(
        CountingDriver::new(dir.path().join("buckets"), true),
        &sandbox_config(dir.path()),
        RetryPolicy::immediate(),
    );
    assert!(offline.probe().await.is_err());
}
