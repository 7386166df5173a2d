//! Job records and the trigger events that create them.
//!
//! - [`Job`]: the orchestration record, owned by the job store
//! - [`JobStatus`]: the per-job state machine
//! - [`TriggerEvent`]: a validated webhook event

pub mod record;
pub mod trigger;

pub use record::{FailureReason, Job, JobResult, JobStatus, RuntimeKind, WorkloadStep};
pub use trigger::{LimitOverrides, TriggerEvent};
