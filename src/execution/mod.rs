//! Execution isolation.
//!
//! # Data Flow
//! ```text
//! connection task (I/O thread)
//!     → lane.rs (per-connection FIFO, one drain in flight; body chunks wait
//!       for room in the lane's buffer budget)
//!     → pool.rs (memory-aware thread pool)
//!         ↳ saturated or shut down → policy.rs (caller-runs | abort | discard)
//!     → Dispatcher → InvocationState → handler code
//! ```
//!
//! With no pool configured the lane drains on the I/O thread itself.

pub mod lane;
pub mod policy;
pub mod pool;

use thiserror::Error;

pub use lane::ExecutionLane;
pub use policy::{
    AbortPolicy, CallerRuns, DiscardPolicy, RejectionPolicy, RejectionPolicyKind, Task,
};
pub use pool::ExecutorPool;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("task of {cost} bytes rejected: {pending} of {limit} bytes already pending")]
    Rejected { cost: usize, pending: usize, limit: usize },

    #[error("executor is shut down")]
    Shutdown,

    #[error("cannot spawn executor thread: {0}")]
    Spawn(#[source] std::io::Error),
}
