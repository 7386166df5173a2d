use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::runtime::ResourceLimits;

/// Runtime family a job (or one of its steps) executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeKind {
    #[serde(rename = "JVM")]
    Jvm,
    Node,
    Python,
    /// Ordered pipeline of steps, each on its own runtime
    Mixed,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Jvm => "JVM",
            RuntimeKind::Node => "Node",
            RuntimeKind::Python => "Python",
            RuntimeKind::Mixed => "Mixed",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jvm" | "java" => Ok(RuntimeKind::Jvm),
            "node" | "nodejs" => Ok(RuntimeKind::Node),
            "python" => Ok(RuntimeKind::Python),
            "mixed" => Ok(RuntimeKind::Mixed),
            other => Err(format!("unknown runtime kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Received,
    Mounting,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Received,
        JobStatus::Mounting,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Received => "received",
            JobStatus::Mounting => "mounting",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    /// Holding a mount or a runtime slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Mounting | JobStatus::Running)
    }

    /// Edges of the job state machine.
    ///
    /// `Mounting`/`Running` back to `Received` is the crash-recovery re-drive;
    /// terminal states have no outgoing edges.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Received, Mounting)
                | (Received, Failed)
                | (Mounting, Running)
                | (Mounting, Failed)
                | (Mounting, Received)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Received)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// Why a job ended in `Failed` or `TimedOut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MountError,
    PoolExhausted,
    NonZeroExit,
    ResourceExceeded,
    TimedOut,
    Cancelled,
    SpawnFailed,
    CrashRecovery,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MountError => "mount_error",
            FailureReason::PoolExhausted => "pool_exhausted",
            FailureReason::NonZeroExit => "non_zero_exit",
            FailureReason::ResourceExceeded => "resource_exceeded",
            FailureReason::TimedOut => "timed_out",
            FailureReason::Cancelled => "cancelled",
            FailureReason::SpawnFailed => "spawn_failed",
            FailureReason::CrashRecovery => "crash_recovery",
            FailureReason::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One runtime invocation inside a job. Empty `args` means the runtime's
/// configured default entrypoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStep {
    pub runtime: RuntimeKind,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkloadStep {
    pub fn new(runtime: RuntimeKind, args: Vec<String>) -> Self {
        Self { runtime, args }
    }
}

/// What the last executed step produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    /// Full stdout written into the sandbox, when it was writable
    pub stdout_ref: Option<PathBuf>,
    pub stderr_ref: Option<PathBuf>,
    pub artifacts: Vec<PathBuf>,
    /// Index of the step that produced this result
    pub step: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source: String,
    pub idempotency_key: String,
    pub runtime: RuntimeKind,
    pub input_ref: String,
    pub steps: Vec<WorkloadStep>,
    pub limits: ResourceLimits,
    /// Raw trigger event, kept verbatim
    pub payload: Map<String, Value>,
    pub status: JobStatus,
    pub reason: Option<FailureReason>,
    pub error: Option<String>,
    pub sandbox_path: Option<PathBuf>,
    pub result: Option<JobResult>,
    pub retry_count: u32,
    /// Bumped on every store write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        source: String,
        idempotency_key: String,
        runtime: RuntimeKind,
        input_ref: String,
        steps: Vec<WorkloadStep>,
        limits: ResourceLimits,
        payload: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source,
            idempotency_key,
            runtime,
            input_ref,
            steps,
            limits,
            payload,
            status: JobStatus::Received,
            reason: None,
            error: None,
            sandbox_path: None,
            result: None,
            retry_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping completion time on terminal states.
    pub fn transition(&mut self, next: JobStatus) {
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Move to a terminal failure state with a reason and message.
    pub fn fail(&mut self, status: JobStatus, reason: FailureReason, error: impl Into<String>) {
        self.transition(status);
        self.reason = Some(reason);
        self.error = Some(error.into());
    }

    pub fn is_stale(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status.is_in_flight() && now - self.updated_at > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "ci".to_string(),
            "abc".to_string(),
            RuntimeKind::Python,
            "gs://bucket/x".to_string(),
            vec![WorkloadStep::new(RuntimeKind::Python, vec![])],
            ResourceLimits::default(),
            Map::new(),
        )
    }

    #[test]
    fn new_job_is_received() {
        let job = job();
        assert_eq!(job.status, JobStatus::Received);
        assert_eq!(job.retry_count, 0);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [JobStatus::Succeeded, JobStatus::Failed, JobStatus::TimedOut] {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn forward_edges_follow_the_state_machine() {
        assert!(JobStatus::Received.can_transition_to(JobStatus::Mounting));
        assert!(JobStatus::Mounting.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::TimedOut));
        assert!(!JobStatus::Received.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Mounting.can_transition_to(JobStatus::Succeeded));
    }

    #[test]
    fn runtime_kind_parsing_is_case_insensitive() {
        assert_eq!("python".parse::<RuntimeKind>().unwrap(), RuntimeKind::Python);
        assert_eq!("JVM".parse::<RuntimeKind>().unwrap(), RuntimeKind::Jvm);
        assert_eq!("java".parse::<RuntimeKind>().unwrap(), RuntimeKind::Jvm);
        assert_eq!("Mixed".parse::<RuntimeKind>().unwrap(), RuntimeKind::Mixed);
        assert!("ruby".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn status_round_trips_through_display() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn fail_stamps_reason_and_completion() {
        let mut job = job();
        job.fail(JobStatus::Failed, FailureReason::Cancelled, "cancelled by request");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.reason, Some(FailureReason::Cancelled));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn staleness_only_applies_to_in_flight_states() {
        let mut job = job();
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(!job.is_stale(chrono::Duration::minutes(1), later));
        job.status = JobStatus::Running;
        assert!(job.is_stale(chrono::Duration::minutes(1), later));
        assert!(!job.is_stale(chrono::Duration::hours(2), later));
    }
}
