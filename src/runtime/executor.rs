use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::runtime::ResourceLimits;

const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Captured result of one subprocess run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: Option<i32>,
    /// Terminating signal, when the process did not exit normally
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration: Duration,
}

/// How a subprocess run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Exited on its own, within limits
    Completed(ExecutionOutput),
    /// Killed after exceeding the wall-clock limit
    TimedOut(ExecutionOutput),
    /// Killed (or signalled by the kernel) after exceeding a resource limit
    ResourceExceeded {
        resource: String,
        output: ExecutionOutput,
    },
    /// Killed because the job was cancelled
    Cancelled(ExecutionOutput),
}

impl ExecutionOutcome {
    pub fn output(&self) -> &ExecutionOutput {
        match self {
            ExecutionOutcome::Completed(o)
            | ExecutionOutcome::TimedOut(o)
            | ExecutionOutcome::Cancelled(o) => o,
            ExecutionOutcome::ResourceExceeded { output, .. } => output,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed(o) if o.exit_code == Some(0))
    }
}

enum Verdict {
    Exited(ExitStatus),
    TimedOut,
    MemoryExceeded(u64),
    Cancelled,
}

/// Bytes captured from one output stream so far.
#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

/// Run `program args` in `workdir` as the leader of a fresh process group.
///
/// The whole group is killed once the run ends, however it ends, so helpers
/// the workload forked (test runners, JVM forks, stray `&` jobs) never
/// outlive it.
pub async fn run_subprocess(
    program: &str,
    args: &[String],
    workdir: &Path,
    env: &[(String, String)],
    limits: &ResourceLimits,
    max_output_bytes: usize,
    cancel: &CancellationToken,
) -> std::io::Result<ExecutionOutcome> {
    tracing::debug!(program, ?args, workdir = %workdir.display(), "Spawning workload");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        cmd.process_group(0);
        let child_limits = limits.clone();
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || child_limits.apply_rlimits());
        }
    }

    let started = Instant::now();
    let mut child = cmd.spawn()?;
    let pid = child.id();

    let stdout = SharedCapture::default();
    let stderr = SharedCapture::default();
    let stdout_task = child
        .stdout
        .take()
        .map(|s| tokio::spawn(read_capped(s, max_output_bytes, stdout.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|s| tokio::spawn(read_capped(s, max_output_bytes, stderr.clone())));

    let deadline = tokio::time::sleep(limits.wall_clock());
    tokio::pin!(deadline);
    let mut memory_tick = tokio::time::interval(MEMORY_POLL_INTERVAL);
    let memory_limit = limits.memory_bytes;

    let verdict = loop {
        tokio::select! {
            status = child.wait() => break Verdict::Exited(status?),
            _ = &mut deadline => break Verdict::TimedOut,
            _ = cancel.cancelled() => break Verdict::Cancelled,
            _ = memory_tick.tick(), if memory_limit.is_some() => {
                let rss = match pid {
                    Some(pgid) => tokio::task::spawn_blocking(move || group_rss_bytes(pgid))
                        .await
                        .ok()
                        .flatten(),
                    None => None,
                };
                if let (Some(limit), Some(rss)) = (memory_limit, rss) {
                    if rss > limit {
                        break Verdict::MemoryExceeded(rss);
                    }
                }
            }
        }
    };

    // Descendants share the leader's group; take them down with it
    if let Some(pid) = pid {
        kill_group(pid);
    }
    let status = match verdict {
        Verdict::Exited(status) => Some(status),
        _ => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };

    let ((stdout, out_truncated), (stderr, err_truncated)) = tokio::join!(
        collect(stdout_task, &stdout),
        collect(stderr_task, &stderr)
    );

    let output = ExecutionOutput {
        exit_code: status.and_then(|s| s.code()),
        signal: status.and_then(exit_signal),
        stdout,
        stderr,
        truncated: out_truncated || err_truncated,
        duration: started.elapsed(),
    };

    let outcome = match verdict {
        Verdict::Exited(_) if output.signal == Some(SIGXCPU) => ExecutionOutcome::ResourceExceeded {
            resource: "cpu".to_string(),
            output,
        },
        Verdict::Exited(_) => ExecutionOutcome::Completed(output),
        Verdict::TimedOut => ExecutionOutcome::TimedOut(output),
        Verdict::MemoryExceeded(rss) => ExecutionOutcome::ResourceExceeded {
            resource: format!("memory ({} bytes resident)", rss),
            output,
        },
        Verdict::Cancelled => ExecutionOutcome::Cancelled(output),
    };

    tracing::debug!(
        program,
        exit_code = ?outcome.output().exit_code,
        duration_ms = outcome.output().duration.as_millis() as u64,
        "Workload finished"
    );
    Ok(outcome)
}

/// Read a stream to EOF into `sink`, keeping at most `cap` bytes. The rest
/// is drained so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize, sink: SharedCapture) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let Ok(mut capture) = sink.lock() else { break };
                let room = cap.saturating_sub(capture.bytes.len());
                if n > room {
                    capture.truncated = true;
                }
                capture.bytes.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
}

/// Wait for a reader to hit EOF, then take what it captured. Whatever was
/// read before the drain timeout is kept.
async fn collect(
    task: Option<tokio::task::JoinHandle<()>>,
    sink: &SharedCapture,
) -> (String, bool) {
    let mut cut_short = false;
    if let Some(mut task) = task {
        // A descendant that escaped the process group can hold the pipe open
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await.is_err() {
            task.abort();
            cut_short = true;
        }
    }
    let capture = match sink.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    (
        String::from_utf8_lossy(&capture.bytes).into_owned(),
        capture.truncated || cut_short,
    )
}

#[cfg(unix)]
const SIGXCPU: i32 = libc::SIGXCPU;
#[cfg(not(unix))]
const SIGXCPU: i32 = -1;

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Resident set size of every process in group `pgid`, from `/proc`.
#[cfg(target_os = "linux")]
fn group_rss_bytes(pgid: u32) -> Option<u64> {
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if page_size > 0 { page_size as u64 } else { 4096 };

    let mut total_pages = 0u64;
    let mut found = false;
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // Fields after the parenthesised command name: state ppid pgrp ... rss is field 24
        let Some(rest) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let pgrp = fields.get(2).and_then(|f| f.parse::<u32>().ok());
        if pgrp != Some(pgid) {
            continue;
        }
        if let Some(rss) = fields.get(21).and_then(|f| f.parse::<u64>().ok()) {
            total_pages += rss;
            found = true;
        }
    }
    found.then_some(total_pages * page_size)
}

#[cfg(not(target_os = "linux"))]
fn group_rss_bytes(_pgid: u32) -> Option<u64> {
    None
}
