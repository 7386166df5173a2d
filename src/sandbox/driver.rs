use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::{OrchestratorError, Result};
use crate::sandbox::InputRef;

/// Mechanism that exposes remote storage at a local path.
///
/// The orchestrator only relies on read/write/list at the mount point; how
/// the bytes get there is the driver's business.
#[async_trait]
pub trait MountDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start exposing `source` at `mount_point`. May return before the mount
    /// is usable; readiness is checked separately.
    async fn mount(&self, source: &InputRef, mount_point: &Path) -> Result<()>;

    async fn is_ready(&self, mount_point: &Path) -> bool;

    /// Stop exposing whatever is at `mount_point`. Must tolerate a mount
    /// point that was never (or only partially) mounted.
    async fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Whether the driver can mount at all right now.
    async fn probe(&self) -> Result<()>;
}

/// Cloud Storage bucket mounted with `gcsfuse`.
#[derive(Debug, Clone)]
pub struct FuseMountDriver {
    fuse_binary: String,
    unmount_binary: String,
}

impl FuseMountDriver {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            fuse_binary: config.fuse_binary.clone(),
            unmount_binary: config.unmount_binary.clone(),
        }
    }

    async fn run(program: &str, args: &[String]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| OrchestratorError::Mount(format!("failed to run {}: {}", program, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(OrchestratorError::Mount(format!(
                "{} exited with {:?}: {}",
                program,
                output.status.code(),
                stderr.trim()
            )))
        }
    }

    fn is_mounted(mount_point: &Path) -> bool {
        let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
            return false;
        };
        let target = mount_point.to_string_lossy();
        mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mounted| mounted == target)
    }
}

#[async_trait]
impl MountDriver for FuseMountDriver {
    fn name(&self) -> &'static str {
        "fuse"
    }

    async fn mount(&self, source: &InputRef, mount_point: &Path) -> Result<()> {
        tokio::fs::create_dir_all(mount_point).await?;
        let mut args = vec!["--implicit-dirs".to_string()];
        if !source.prefix.is_empty() {
            args.push("--only-dir".to_string());
            args.push(source.prefix.clone());
        }
        args.push(source.bucket.clone());
        args.push(mount_point.display().to_string());
        Self::run(&self.fuse_binary, &args).await
    }

    async fn is_ready(&self, mount_point: &Path) -> bool {
        Self::is_mounted(mount_point) && tokio::fs::read_dir(mount_point).await.is_ok()
    }

    async fn unmount(&self, mount_point: &Path) -> Result<()> {
        if Self::is_mounted(mount_point) {
            Self::run(
                &self.unmount_binary,
                &["-u".to_string(), mount_point.display().to_string()],
            )
            .await?;
        }
        match tokio::fs::remove_dir(mount_point).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OrchestratorError::Mount(format!(
                "failed to remove mount point {}: {}",
                mount_point.display(),
                e
            ))),
        }
    }

    async fn probe(&self) -> Result<()> {
        for binary in [&self.fuse_binary, &self.unmount_binary] {
            if let Err(e) = which::which(binary) {
                return Err(OrchestratorError::Mount(format!(
                    "{} not usable: {}",
                    binary, e
                )));
            }
        }
        Ok(())
    }
}

/// Maps `bucket/prefix` onto `root/bucket/prefix` via a symlink at the
/// mount point. For development and tests; no remote storage involved.
#[derive(Debug, Clone)]
pub struct LocalMountDriver {
    root: PathBuf,
}

impl LocalMountDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn backing_dir(&self, source: &InputRef) -> PathBuf {
        let mut dir = self.root.join(&source.bucket);
        if !source.prefix.is_empty() {
            dir = dir.join(&source.prefix);
        }
        dir
    }
}

#[async_trait]
impl MountDriver for LocalMountDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn mount(&self, source: &InputRef, mount_point: &Path) -> Result<()> {
        let backing = self.backing_dir(source);
        tokio::fs::create_dir_all(&backing).await?;
        if let Some(parent) = mount_point.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::symlink(&backing, mount_point).await?;
        Ok(())
    }

    async fn is_ready(&self, mount_point: &Path) -> bool {
        tokio::fs::read_dir(mount_point).await.is_ok()
    }

    async fn unmount(&self, mount_point: &Path) -> Result<()> {
        match tokio::fs::symlink_metadata(mount_point).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                tokio::fs::remove_file(mount_point).await?;
                Ok(())
            }
            Ok(meta) if meta.is_dir() => {
                tokio::fs::remove_dir_all(mount_point).await?;
                Ok(())
            }
            Ok(_) => {
                tokio::fs::remove_file(mount_point).await?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn probe(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}
