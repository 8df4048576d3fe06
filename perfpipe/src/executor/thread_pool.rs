//! # Elastic Thread Pool
//!
//! Runs opaque actions on a set of worker threads whose size follows the load:
//!
//! - `min_size` workers are started eagerly and never retire.
//! - [`ThreadPool::schedule`] starts one more worker (up to `max_size`) when the
//!   backlog outgrows the idle workers.
//! - A worker that stays idle for `idle_ttl` retires if the pool is above
//!   `min_size`.
//!
//! ## Worker lifecycle
//!
//! ```text
//!   Idle ──action──▶ Busy ──done──▶ Idle ──ttl, size > min──▶ Retiring ──▶ Joined
//! ```
//!
//! A retiring worker cannot join itself. It moves its own `JoinHandle` from
//! the registry to a finished list, and whoever next calls `schedule` or
//! `wait` joins it.
//!
//! ## Shutdown
//!
//! Cooperative only: [`ThreadPool::shutdown`] lets workers drain the queued
//! actions and exit; [`ThreadPool::wait`] blocks until they all have.
//! Nothing in flight is interrupted.
//!
//! One lock guards the action queue, the worker registry and the counters.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, error};
use parking_lot::{Condvar, Mutex, MutexGuard};

/// Opaque unit of deferred work
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Applied around every action, e.g. for instrumentation. The wrapper is
/// responsible for running the action it receives.
pub type ActionWrapper = Arc<dyn Fn(Action) + Send + Sync + 'static>;

/// Smallest accepted idle TTL; anything shorter makes workers churn.
pub const MIN_IDLE_TTL: Duration = Duration::from_micros(1);

struct PoolState {
    scheduled_actions: VecDeque<Action>,
    worker_threads: HashMap<ThreadId, JoinHandle<()>>,
    finished_threads: Vec<JoinHandle<()>>,
    idle_threads: usize,
    shutdown_initiated: bool,
    spawned_count: usize,
}

impl PoolState {
    fn has_work_or_shutdown(&self) -> bool {
        !self.scheduled_actions.is_empty() || self.shutdown_initiated
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    work_available: Condvar,
    worker_exited: Condvar,
    min_size: usize,
    max_size: usize,
    idle_ttl: Duration,
}

pub struct ThreadPool {
    inner: Arc<PoolInner>,
    run_action: Option<ActionWrapper>,
}

impl ThreadPool {
    /// Create a pool and start `min_size` workers.
    ///
    /// # Panics
    ///
    /// If `min_size` is 0, `max_size < min_size`, or `idle_ttl` is below
    /// [`MIN_IDLE_TTL`].
    #[must_use]
    pub fn new(min_size: usize, max_size: usize, idle_ttl: Duration) -> Self {
        Self::build(min_size, max_size, idle_ttl, None)
    }

    /// Same as [`ThreadPool::new`], running every action through `run_action`.
    ///
    /// # Panics
    ///
    /// See [`ThreadPool::new`].
    #[must_use]
    pub fn with_wrapper(
        min_size: usize,
        max_size: usize,
        idle_ttl: Duration,
        run_action: ActionWrapper,
    ) -> Self {
        Self::build(min_size, max_size, idle_ttl, Some(run_action))
    }

    fn build(
        min_size: usize,
        max_size: usize,
        idle_ttl: Duration,
        run_action: Option<ActionWrapper>,
    ) -> Self {
        assert!(min_size > 0, "thread pool minimum size must be positive");
        assert!(
            max_size >= min_size,
            "thread pool maximum size {max_size} is below minimum size {min_size}"
        );
        assert!(idle_ttl >= MIN_IDLE_TTL, "thread pool idle TTL {idle_ttl:?} is too small");

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                scheduled_actions: VecDeque::new(),
                worker_threads: HashMap::new(),
                finished_threads: Vec::new(),
                idle_threads: 0,
                shutdown_initiated: false,
                spawned_count: 0,
            }),
            work_available: Condvar::new(),
            worker_exited: Condvar::new(),
            min_size,
            max_size,
            idle_ttl,
        });

        {
            let mut state = inner.state.lock();
            for _ in 0..min_size {
                PoolInner::create_worker(&inner, &mut state);
            }
        }

        Self { inner, run_action }
    }

    /// Queue an action. Safe to call from any thread.
    ///
    /// # Panics
    ///
    /// If called after [`ThreadPool::shutdown`], or if the OS refuses to
    /// spawn a new worker thread.
    pub fn schedule<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let action: Action = match &self.run_action {
            Some(run_action) => {
                let run_action = Arc::clone(run_action);
                let action: Action = Box::new(action);
                Box::new(move || run_action(action))
            }
            None => Box::new(action),
        };

        let finished = {
            let mut state = self.inner.state.lock();
            assert!(!state.shutdown_initiated, "action scheduled on a thread pool after shutdown");

            state.scheduled_actions.push_back(action);
            if state.idle_threads < state.scheduled_actions.len()
                && state.worker_threads.len() < self.inner.max_size
            {
                PoolInner::create_worker(&self.inner, &mut state);
            }
            self.inner.work_available.notify_one();

            std::mem::take(&mut state.finished_threads)
        };

        join_finished(finished);
    }

    /// Queue a computation and receive its result once a worker ran it.
    ///
    /// The receiver reports a disconnect if the computation panicked.
    ///
    /// # Panics
    ///
    /// See [`ThreadPool::schedule`].
    pub fn schedule_with_result<F, T>(&self, computation: F) -> Receiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        self.schedule(move || {
            // The caller may have dropped the receiver
            let _ = result_tx.send(computation());
        });
        result_rx
    }

    /// Current number of workers
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.inner.state.lock().worker_threads.len()
    }

    /// Workers currently running an action
    #[must_use]
    pub fn busy_thread_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.worker_threads.len() - state.idle_threads
    }

    /// Actions queued but not yet picked up
    #[must_use]
    pub fn queued_action_count(&self) -> usize {
        self.inner.state.lock().scheduled_actions.len()
    }

    /// Stop accepting actions. Queued actions still run.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown_initiated = true;
        self.inner.work_available.notify_all();
    }

    /// Block until every worker has exited and been joined.
    ///
    /// # Panics
    ///
    /// If called before [`ThreadPool::shutdown`].
    pub fn wait(&self) {
        let finished = {
            let mut state = self.inner.state.lock();
            assert!(state.shutdown_initiated, "ThreadPool::wait called before shutdown");
            while !state.worker_threads.is_empty() {
                self.inner.worker_exited.wait(&mut state);
            }
            std::mem::take(&mut state.finished_threads)
        };

        join_finished(finished);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        self.wait();
    }
}

impl PoolInner {
    fn create_worker(inner: &Arc<Self>, state: &mut PoolState) {
        assert!(!state.shutdown_initiated, "worker created after shutdown");

        let index = state.spawned_count;
        state.spawned_count += 1;
        state.idle_threads += 1;

        let worker_inner = Arc::clone(inner);
        let handle = thread::Builder::new()
            .name(format!("perfpipe-pool-{index}"))
            .spawn(move || worker_inner.worker_loop())
            .expect("failed to spawn thread pool worker");

        let previous = state.worker_threads.insert(handle.thread().id(), handle);
        assert!(previous.is_none(), "thread id reused by a live worker");
    }

    /// Blocks for work. Returns `None` when the calling worker must exit.
    fn take_action(&self, state: &mut MutexGuard<'_, PoolState>) -> Option<Action> {
        while !state.has_work_or_shutdown() {
            let timed_out = self.work_available.wait_for(state, self.idle_ttl).timed_out();
            if timed_out
                && !state.has_work_or_shutdown()
                && state.worker_threads.len() > self.min_size
            {
                return None;
            }
        }

        // Empty here means shutdown with nothing left to run
        state.scheduled_actions.pop_front()
    }

    fn worker_loop(&self) {
        let mut state = self.state.lock();
        loop {
            let action = self.take_action(&mut state);

            assert!(state.idle_threads > 0, "idle worker count underflow");
            state.idle_threads -= 1;

            let Some(action) = action else {
                let thread_id = thread::current().id();
                if let Some(handle) = state.worker_threads.remove(&thread_id) {
                    state.finished_threads.push(handle);
                }
                debug!("Thread pool worker retiring ({} left)", state.worker_threads.len());
                self.worker_exited.notify_all();
                break;
            };

            MutexGuard::unlocked(&mut state, || run_contained(action));
            state.idle_threads += 1;
        }
    }
}

fn run_contained(action: Action) {
    if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
        error!("Thread pool action panicked");
    }
}

fn join_finished(finished: Vec<JoinHandle<()>>) {
    for handle in finished {
        if handle.join().is_err() {
            error!("Thread pool worker terminated abnormally");
        }
    }
}
