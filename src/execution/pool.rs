//! Memory-aware executor pool.
//!
//! # Responsibilities
//! - Run handler work off the I/O threads
//! - Grow on demand up to the configured thread count, shrink when idle
//! - Refuse work once the queued bytes would exceed the configured limit
//!
//! # Design Decisions
//! - Plain OS threads: handler code is blocking by contract
//! - Queued tasks still run after shutdown; new ones go to the policy
//! - A panicking task is logged and does not take its worker down

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::execution::policy::{RejectionPolicy, Task};
use crate::execution::ExecutionError;
use crate::http::invocation::panic_message;

struct PoolState {
    queue: VecDeque<Task>,
    threads: usize,
    idle: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    terminated: Condvar,
    pending_bytes: AtomicUsize,
    next_thread: AtomicUsize,
}

/// Thread pool with admission control by estimated memory cost.
pub struct ExecutorPool {
    shared: Arc<Shared>,
    policy: Arc<dyn RejectionPolicy>,
    max_threads: usize,
    keep_alive: Duration,
    max_pending_bytes: usize,
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("max_threads", &self.max_threads)
            .field("threads", &self.thread_count())
            .field("pending_bytes", &self.pending_bytes())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ExecutorPool {
    /// `max_pending_bytes` of 0 admits everything.
    pub fn new(
        max_threads: usize,
        keep_alive: Duration,
        max_pending_bytes: usize,
        policy: Arc<dyn RejectionPolicy>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    threads: 0,
                    idle: 0,
                    shutdown: false,
                }),
                work_available: Condvar::new(),
                terminated: Condvar::new(),
                pending_bytes: AtomicUsize::new(0),
                next_thread: AtomicUsize::new(1),
            }),
            policy,
            max_threads: max_threads.max(1),
            keep_alive,
            max_pending_bytes,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn max_pending_bytes(&self) -> usize {
        self.max_pending_bytes
    }

    /// Bytes admitted but not yet executed.
    pub fn pending_bytes(&self) -> usize {
        self.shared.pending_bytes.load(Ordering::Acquire)
    }

    /// Live worker threads.
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().threads
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Queue `task`, or hand it to the rejection policy.
    pub fn execute(&self, task: Task) -> Result<(), ExecutionError> {
        let cost = task.cost();
        if !self.try_reserve(cost) {
            return self.reject(task);
        }

        let mut state = self.shared.state.lock();
        if state.shutdown {
            drop(state);
            self.release(cost);
            return self.policy.rejected(task, self);
        }

        state.queue.push_back(task);
        if state.threads < self.max_threads && state.idle < state.queue.len() {
            if let Err(e) = self.spawn_worker(&mut state) {
                if state.threads == 0 {
                    state.queue.pop_back();
                    drop(state);
                    self.release(cost);
                    return Err(ExecutionError::Spawn(e));
                }
                tracing::warn!(error = %e, threads = state.threads, "Cannot grow executor pool");
            }
        }
        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Stop accepting work and wait up to `timeout` for the workers to
    /// finish what is queued. Returns whether every worker exited.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.work_available.notify_all();
        while state.threads > 0 {
            if self.shared.terminated.wait_until(&mut state, deadline).timed_out() {
                tracing::warn!(
                    threads = state.threads,
                    "Executor threads still running after shutdown timeout"
                );
                return state.threads == 0;
            }
        }
        true
    }

    /// Charge `cost` bytes against the pending limit, if they fit.
    pub(crate) fn try_reserve(&self, cost: usize) -> bool {
        let limit = self.max_pending_bytes;
        self.shared
            .pending_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                let charged = pending.saturating_add(cost);
                (limit == 0 || charged <= limit).then_some(charged)
            })
            .is_ok()
    }

    /// Return bytes charged by [`try_reserve`](Self::try_reserve).
    pub(crate) fn release(&self, cost: usize) {
        self.shared.pending_bytes.fetch_sub(cost, Ordering::AcqRel);
    }

    /// Hand a task that does not fit to the rejection policy.
    pub(crate) fn reject(&self, task: Task) -> Result<(), ExecutionError> {
        tracing::debug!(
            cost = task.cost(),
            pending = self.pending_bytes(),
            limit = self.max_pending_bytes,
            "Executor saturated"
        );
        self.policy.rejected(task, self)
    }

    fn spawn_worker(&self, state: &mut MutexGuard<'_, PoolState>) -> std::io::Result<()> {
        let id = self.shared.next_thread.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let keep_alive = self.keep_alive;
        thread::Builder::new()
            .name(format!("http-executor-{id}"))
            .spawn(move || worker(shared, keep_alive))?;
        state.threads += 1;
        Ok(())
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_available.notify_all();
    }
}

fn worker(shared: Arc<Shared>, keep_alive: Duration) {
    let mut state = shared.state.lock();
    loop {
        if let Some(task) = state.queue.pop_front() {
            let cost = task.cost();
            MutexGuard::unlocked(&mut state, || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                    let panic = panic_message(payload.as_ref());
                    tracing::error!(%panic, "Executor task panicked");
                }
                shared.pending_bytes.fetch_sub(cost, Ordering::AcqRel);
            });
            continue;
        }
        if state.shutdown {
            break;
        }

        state.idle += 1;
        let timed_out = shared.work_available.wait_for(&mut state, keep_alive).timed_out();
        state.idle -= 1;
        if timed_out && state.queue.is_empty() {
            break;
        }
    }

    state.threads -= 1;
    if state.threads == 0 {
        shared.terminated.notify_all();
    }
}
