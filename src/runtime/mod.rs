//! Runtime pool: bounded, isolated subprocess execution.
//!
//! - [`RuntimePool`]: one counting semaphore per [`RuntimeKind`](crate::job::RuntimeKind)
//! - [`Runtime`]: the capability the orchestrator executes through
//! - [`SubprocessRuntime`]: JVM, Node and Python launched as executables on PATH
//! - [`ResourceLimits`]: wall-clock, memory and CPU limits per execution
//!
//! # Execution Flow
//!
//! 1. [`RuntimePool::acquire`] reserves a slot or fails with `PoolExhausted`
//! 2. [`RuntimePool::execute`] runs the workload rooted at the sandbox mount
//! 3. Output is captured and the outcome classified (exit, timeout, limit, cancel)
//! 4. [`RuntimePool::release`] (or dropping the handle) frees the slot

pub mod executor;
pub mod limits;
pub mod pool;

pub use executor::{ExecutionOutcome, ExecutionOutput};
pub use limits::ResourceLimits;
pub use pool::{Runtime, RuntimeHandle, RuntimePool, SubprocessRuntime};
