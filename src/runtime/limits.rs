//! Resource limits for workload subprocesses.
//!
//! | Limit | Enforcement |
//! |-------|-------------|
//! | wall clock | executor deadline, whole process group killed |
//! | memory | RSS watchdog over the process group |
//! | CPU time | `RLIMIT_CPU` (soft; `SIGXCPU` is reported as exceeded) |
//!
//! `RLIMIT_AS` is not used: the JVM and V8 reserve far more address space
//! than they commit, and would fail to start under any realistic cap.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub wall_clock_ms: u64,
    pub memory_bytes: Option<u64>,
    pub cpu_secs: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock_ms: 15 * 60 * 1000,
            memory_bytes: Some(2 * 1024 * 1024 * 1024),
            cpu_secs: None,
        }
    }
}

impl ResourceLimits {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_millis(self.wall_clock_ms)
    }

    pub fn with_wall_clock(mut self, limit: Duration) -> Self {
        self.wall_clock_ms = limit.as_millis() as u64;
        self
    }

    pub fn with_memory_bytes(mut self, bytes: Option<u64>) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_cpu_secs(mut self, secs: Option<u64>) -> Self {
        self.cpu_secs = secs;
        self
    }

    /// Never exceed `max`; an unset limit inherits the maximum.
    pub fn clamp_to(&self, max: &ResourceLimits) -> ResourceLimits {
        fn cap(value: Option<u64>, max: Option<u64>) -> Option<u64> {
            match (value, max) {
                (Some(v), Some(m)) => Some(v.min(m)),
                (None, Some(m)) => Some(m),
                (v, None) => v,
            }
        }
        ResourceLimits {
            wall_clock_ms: self.wall_clock_ms.min(max.wall_clock_ms),
            memory_bytes: cap(self.memory_bytes, max.memory_bytes),
            cpu_secs: cap(self.cpu_secs, max.cpu_secs),
        }
    }

    /// Applied in the forked child before exec. Only async-signal-safe calls.
    #[cfg(unix)]
    pub(crate) fn apply_rlimits(&self) -> std::io::Result<()> {
        if let Some(secs) = self.cpu_secs {
            // Hard limit one second above soft so the child sees SIGXCPU, not SIGKILL
            set_rlimit(libc::RLIMIT_CPU, secs, secs.saturating_add(1))?;
        }
        set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_rlimit(resource: RlimitResource, soft: u64, hard: u64) -> std::io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: rlim is a valid, initialised struct and resource is a libc constant.
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(all(unix, target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;

#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;
