//! Tasks and what happens to the ones the pool refuses.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::execution::pool::ExecutorPool;
use crate::execution::ExecutionError;
use crate::observability::metrics;

/// A unit of work with its estimated memory cost in bytes.
pub struct Task {
    job: Box<dyn FnOnce() + Send + 'static>,
    cost: usize,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("cost", &self.cost).finish()
    }
}

impl Task {
    pub fn new(cost: usize, job: impl FnOnce() + Send + 'static) -> Self {
        Self {
            job: Box::new(job),
            cost,
        }
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    pub fn run(self) {
        (self.job)()
    }
}

/// Decides the fate of a task the pool cannot admit.
pub trait RejectionPolicy: Send + Sync + fmt::Debug {
    fn rejected(&self, task: Task, pool: &ExecutorPool) -> Result<(), ExecutionError>;
}

/// Run the task on the submitting thread, unless the pool is shut down.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerRuns;

impl RejectionPolicy for CallerRuns {
    fn rejected(&self, task: Task, pool: &ExecutorPool) -> Result<(), ExecutionError> {
        metrics::record_rejection("caller-runs");
        if pool.is_shutdown() {
            tracing::debug!(cost = task.cost(), "Task discarded, executor is shut down");
            return Ok(());
        }
        task.run();
        Ok(())
    }
}

/// Refuse the task with an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortPolicy;

impl RejectionPolicy for AbortPolicy {
    fn rejected(&self, task: Task, pool: &ExecutorPool) -> Result<(), ExecutionError> {
        metrics::record_rejection("abort");
        if pool.is_shutdown() {
            return Err(ExecutionError::Shutdown);
        }
        Err(ExecutionError::Rejected {
            cost: task.cost(),
            pending: pool.pending_bytes(),
            limit: pool.max_pending_bytes(),
        })
    }
}

/// Silently drop the task.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardPolicy;

impl RejectionPolicy for DiscardPolicy {
    fn rejected(&self, task: Task, _pool: &ExecutorPool) -> Result<(), ExecutionError> {
        metrics::record_rejection("discard");
        tracing::debug!(cost = task.cost(), "Task discarded");
        Ok(())
    }
}

/// Configurable choice of the built-in policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionPolicyKind {
    #[default]
    CallerRuns,
    Abort,
    Discard,
}

impl RejectionPolicyKind {
    pub fn build(self) -> Arc<dyn RejectionPolicy> {
        match self {
            RejectionPolicyKind::CallerRuns => Arc::new(CallerRuns),
            RejectionPolicyKind::Abort => Arc::new(AbortPolicy),
            RejectionPolicyKind::Discard => Arc::new(DiscardPolicy),
        }
    }
}
