//! Per-job sandbox filesystem.
//!
//! Each job gets a fresh mount point under the configured mount root, bound
//! to the bucket/prefix its `input_ref` names. A [`Sandbox`] is handed out
//! by [`SandboxAdapter::mount`] and consumed by [`SandboxAdapter::unmount`],
//! so a successful mount is released exactly once.

pub mod driver;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{MountDriverKind, RetryPolicy, SandboxConfig};
use crate::error::{OrchestratorError, Result};
use crate::job::Job;

pub use driver::{FuseMountDriver, LocalMountDriver, MountDriver};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Remote location a job reads its input from: `gs://bucket[/prefix]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub bucket: String,
    pub prefix: String,
}

impl FromStr for InputRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("gs://")
            .ok_or_else(|| "input_ref must start with gs://".to_string())?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (rest, ""),
        };

        let valid_chars = bucket
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
        let valid_edges = bucket
            .chars()
            .next()
            .zip(bucket.chars().last())
            .map_or(false, |(a, b)| a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric());
        if !(3..=63).contains(&bucket.len()) || !valid_chars || !valid_edges {
            return Err(format!("'{}' is not a valid bucket name", bucket));
        }
        if prefix.split('/').any(|seg| seg == ".." || seg == ".") {
            return Err("input_ref prefix must not contain '.' or '..' segments".to_string());
        }

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }
}

impl std::fmt::Display for InputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "gs://{}", self.bucket)
        } else {
            write!(f, "gs://{}/{}", self.bucket, self.prefix)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Unmounted,
    Mounted,
    Error,
}

/// A live mount owned by exactly one job. Not `Clone`: give it back to
/// [`SandboxAdapter::unmount`] to release it.
#[derive(Debug)]
pub struct Sandbox {
    pub job_id: Uuid,
    pub mount_point: PathBuf,
    pub source: InputRef,
    pub status: MountStatus,
    pub mounted_at: DateTime<Utc>,
}

impl Sandbox {
    pub fn path(&self) -> &Path {
        &self.mount_point
    }
}

/// Allocates, verifies and releases per-job mounts.
pub struct SandboxAdapter {
    driver: Arc<dyn MountDriver>,
    mount_root: PathBuf,
    mount_timeout: Duration,
    attempts: u32,
    retry: RetryPolicy,
    active: Mutex<HashSet<PathBuf>>,
    mounts: AtomicU64,
    unmounts: AtomicU64,
}

impl SandboxAdapter {
    pub fn new(config: &SandboxConfig, retry: RetryPolicy) -> Self {
        let driver: Arc<dyn MountDriver> = match config.driver {
            MountDriverKind::Fuse => Arc::new(FuseMountDriver::new(config)),
            MountDriverKind::Local => Arc::new(LocalMountDriver::new(&config.local_bucket_root)),
        };
        Self::with_driver(driver, config, retry)
    }

    pub fn with_driver(
        driver: Arc<dyn MountDriver>,
        config: &SandboxConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            driver,
            mount_root: config.mount_root.clone(),
            mount_timeout: config.mount_timeout(),
            attempts: config.mount_attempts.max(1),
            retry,
            active: Mutex::new(HashSet::new()),
            mounts: AtomicU64::new(0),
            unmounts: AtomicU64::new(0),
        }
    }

    /// Mount point for the job's current attempt. Re-driven jobs get a new one.
    pub fn mount_point_for(&self, job: &Job) -> PathBuf {
        self.mount_root
            .join(format!("{}-{}", job.id, job.retry_count))
    }

    /// Mount the job's input, retrying with backoff. Blocks until the mount
    /// is verified ready or all attempts failed.
    pub async fn mount(&self, job: &Job) -> Result<Sandbox> {
        self.mount_cancellable(job, &CancellationToken::new()).await
    }

    /// Like [`mount`](Self::mount), but gives up as soon as `cancel` fires.
    /// A cancelled mount is torn down and its mount point freed.
    pub async fn mount_cancellable(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Sandbox> {
        let source: InputRef = job
            .input_ref
            .parse()
            .map_err(|e: String| OrchestratorError::Mount(e))?;
        let mount_point = self.mount_point_for(job);
        self.reserve(&mount_point)?;

        let mounted = tokio::select! {
            mounted = self.mount_with_retries(job.id, &source, &mount_point) => mounted,
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job.id, "Mount interrupted by cancellation");
                if let Err(e) = self.driver.unmount(&mount_point).await {
                    tracing::debug!(error = %e, "Partial mount cleanup failed");
                }
                Err(OrchestratorError::Cancelled(job.id))
            }
        };
        if let Err(e) = mounted {
            self.unreserve(&mount_point);
            return Err(e);
        }

        self.mounts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            job_id = %job.id,
            mount_point = %mount_point.display(),
            source = %source,
            "Sandbox mounted"
        );
        Ok(Sandbox {
            job_id: job.id,
            mount_point,
            source,
            status: MountStatus::Mounted,
            mounted_at: Utc::now(),
        })
    }

    async fn mount_with_retries(
        &self,
        job_id: Uuid,
        source: &InputRef,
        mount_point: &Path,
    ) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.try_mount(source, mount_point).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        %job_id,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Mount attempt failed"
                    );
                    // Clear any half-made mount before trying again
                    if let Err(cleanup) = self.driver.unmount(mount_point).await {
                        tracing::debug!(error = %cleanup, "Partial mount cleanup failed");
                    }
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }

        Err(OrchestratorError::Mount(format!(
            "giving up after {} attempts: {}",
            self.attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn try_mount(&self, source: &InputRef, mount_point: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.mount_root).await?;
        // A crashed process may have left something behind at this path
        if tokio::fs::symlink_metadata(mount_point).await.is_ok() {
            self.driver.unmount(mount_point).await?;
        }

        let mounted = async {
            self.driver.mount(source, mount_point).await?;
            while !self.driver.is_ready(mount_point).await {
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
            Ok::<(), OrchestratorError>(())
        };

        match tokio::time::timeout(self.mount_timeout, mounted).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Mount(format!(
                "mount not ready after {}ms",
                self.mount_timeout.as_millis()
            ))),
        }
    }

    /// Release a mount. Consumes the sandbox so it cannot be released twice.
    pub async fn unmount(&self, mut sandbox: Sandbox) -> Result<()> {
        let result = self.driver.unmount(&sandbox.mount_point).await;
        self.unreserve(&sandbox.mount_point);
        self.unmounts.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(()) => {
                sandbox.status = MountStatus::Unmounted;
                tracing::info!(
                    job_id = %sandbox.job_id,
                    mount_point = %sandbox.mount_point.display(),
                    "Sandbox unmounted"
                );
            }
            Err(e) => {
                sandbox.status = MountStatus::Error;
                tracing::error!(
                    job_id = %sandbox.job_id,
                    mount_point = %sandbox.mount_point.display(),
                    error = %e,
                    "Sandbox unmount failed"
                );
            }
        }
        result
    }

    /// Release a mount left behind by a crashed or abandoned run.
    /// Refuses paths that a live sandbox in this process still owns.
    pub async fn release_stale(&self, mount_point: &Path) -> Result<()> {
        if self.is_active(mount_point) {
            return Err(OrchestratorError::Mount(format!(
                "{} is owned by a live sandbox",
                mount_point.display()
            )));
        }
        if tokio::fs::symlink_metadata(mount_point).await.is_err() {
            return Ok(());
        }
        tracing::info!(mount_point = %mount_point.display(), "Releasing stale mount");
        self.driver.unmount(mount_point).await
    }

    pub async fn probe(&self) -> Result<()> {
        self.driver.probe().await
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn active_mounts(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_active(&self, mount_point: &Path) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(mount_point))
            .unwrap_or(false)
    }

    /// Successful mounts and unmounts since start.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.mounts.load(Ordering::Relaxed),
            self.unmounts.load(Ordering::Relaxed),
        )
    }

    fn reserve(&self, mount_point: &Path) -> Result<()> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| OrchestratorError::Internal("mount registry lock poisoned".to_string()))?;
        if !active.insert(mount_point.to_path_buf()) {
            return Err(OrchestratorError::Mount(format!(
                "mount point {} is already in use",
                mount_point.display()
            )));
        }
        Ok(())
    }

    fn unreserve(&self, mount_point: &Path) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(mount_point);
        }
    }
}
