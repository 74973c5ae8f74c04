//! Bounded Worker Pool
//!
//! Native worker threads fed by a bounded FIFO queue. Each worker owns a
//! single-threaded tokio runtime and drives one task at a time to
//! completion, so a connection handed to a worker is served entirely on
//! that thread.
//!
//! Admission order for a submitted task: an idle worker, then a new worker
//! (while below `max_threads`), then a free queue slot. When all three are
//! exhausted the [`Admission`] policy decides between an immediate
//! [`PoolError::Overloaded`] and a bounded wait for a slot.

use aurora_core::AuroraError;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Unit of work executed by a pool worker.
pub type Task = BoxFuture<'static, ()>;

/// Time given to cancelled tasks to unwind before shutdown gives up on them.
const FORCED_STOP_GRACE: Duration = Duration::from_millis(50);

/// What `submit` does when no worker or queue slot is free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Fail immediately
    Reject,
    /// Wait up to the given duration for a queue slot
    Block(Duration),
}

/// Pool errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Thread pool '{pool}' overloaded: {queued}/{capacity} queued, {threads} threads busy")]
    Overloaded {
        pool: String,
        queued: usize,
        capacity: usize,
        threads: usize,
    },

    #[error("Thread pool '{pool}' is shut down")]
    ShutDown { pool: String },

    #[error("Invalid thread pool configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Failed to spawn worker thread: {reason}")]
    Spawn { reason: String },
}

impl From<PoolError> for AuroraError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Overloaded { .. } | PoolError::ShutDown { .. } => {
                AuroraError::overloaded(err.to_string())
            }
            PoolError::InvalidConfig { .. } | PoolError::Spawn { .. } => {
                AuroraError::internal(err.to_string())
            }
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread name prefix
    pub name: String,
    /// Workers started up front and never reclaimed
    pub min_threads: usize,
    /// Hard cap on live workers
    pub max_threads: usize,
    /// Maximum number of tasks waiting for a worker
    pub queue_capacity: usize,
    /// How long a worker above `min_threads` idles before exiting
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "aurora-worker".to_owned(),
            min_threads: 8,
            max_threads: 200,
            queue_capacity: 100,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), PoolError> {
        if self.min_threads == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "min_threads must be at least 1".to_owned(),
            });
        }
        if self.max_threads < self.min_threads {
            return Err(PoolError::InvalidConfig {
                reason: format!(
                    "max_threads ({}) is below min_threads ({})",
                    self.max_threads, self.min_threads
                ),
            });
        }
        if self.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "queue_capacity must be positive".to_owned(),
            });
        }
        Ok(())
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live worker threads
    pub threads: usize,
    /// Workers waiting for a task
    pub idle: usize,
    /// Workers running a task
    pub active: usize,
    /// Tasks waiting for a worker
    pub queued: usize,
    pub queue_capacity: usize,
    pub max_threads: usize,
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    /// Tasks that panicked (caught by the worker)
    pub panicked: u64,
    /// Tasks cancelled by a shutdown that ran out of time
    pub cancelled: u64,
}

struct PoolState {
    queue: VecDeque<Task>,
    threads: usize,
    idle: usize,
    active: usize,
    shut_down: bool,
    next_worker_id: u64,
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
    cancelled: AtomicU64,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled when a task is queued or the pool shuts down
    task_ready: Condvar,
    /// Signalled when a queue slot frees up or the pool shuts down
    slot_free: Condvar,
    /// Signalled when the last worker exits
    terminated: Condvar,
    cancel: CancellationToken,
    counters: PoolCounters,
}

/// Bounded Thread Pool
///
/// Fixed-ceiling pool of native worker threads with a bounded queue and
/// admission control. The queue never holds more than `queue_capacity`
/// tasks and the pool never runs more than `max_threads` workers.
pub struct BoundedThreadPool {
    shared: Arc<Shared>,
}

impl BoundedThreadPool {
    /// Create a pool and start its `min_threads` core workers
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::with_capacity(config.queue_capacity),
                threads: 0,
                idle: 0,
                active: 0,
                shut_down: false,
                next_worker_id: 0,
            }),
            config,
            task_ready: Condvar::new(),
            slot_free: Condvar::new(),
            terminated: Condvar::new(),
            cancel: CancellationToken::new(),
            counters: PoolCounters::default(),
        });

        {
            let mut state = shared.state.lock();
            for _ in 0..shared.config.min_threads {
                if let Err(e) = spawn_worker(&shared, &mut state) {
                    state.shut_down = true;
                    shared.task_ready.notify_all();
                    return Err(e);
                }
            }
        }

        info!(
            pool = %shared.config.name,
            min_threads = shared.config.min_threads,
            max_threads = shared.config.max_threads,
            queue_capacity = shared.config.queue_capacity,
            "Thread pool started"
        );

        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Submit a task for execution.
    ///
    /// On error the task is dropped without being polled.
    pub fn submit(&self, task: Task, admission: Admission) -> Result<(), PoolError> {
        let shared = &self.shared;
        let deadline = match admission {
            Admission::Reject => None,
            Admission::Block(timeout) => Some(Instant::now() + timeout),
        };
        let mut timed_out = false;
        let mut state = shared.state.lock();

        loop {
            if state.shut_down {
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::ShutDown {
                    pool: shared.config.name.clone(),
                });
            }

            // Grow only when no idle worker is left over after earlier queued tasks
            if state.idle <= state.queue.len() && state.threads < shared.config.max_threads {
                if let Err(e) = spawn_worker(shared, &mut state) {
                    warn!(pool = %shared.config.name, error = %e, "Could not grow pool");
                }
            }

            if state.queue.len() < shared.config.queue_capacity {
                shared.enqueue(&mut state, task);
                return Ok(());
            }

            match deadline {
                Some(deadline) if !timed_out => {
                    timed_out = shared.slot_free.wait_until(&mut state, deadline).timed_out();
                }
                _ => {
                    shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        pool = %shared.config.name,
                        queued = state.queue.len(),
                        "Task rejected, pool saturated"
                    );
                    return Err(PoolError::Overloaded {
                        pool: shared.config.name.clone(),
                        queued: state.queue.len(),
                        capacity: shared.config.queue_capacity,
                        threads: state.threads,
                    });
                }
            }
        }
    }

    /// Shut the pool down.
    ///
    /// New submissions fail immediately. Running and queued tasks get
    /// `timeout` to finish; after that running tasks are cancelled at their
    /// next await point and queued tasks are dropped. Returns `true` when
    /// every worker exited within `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        let deadline = Instant::now() + timeout;
        let mut state = shared.state.lock();

        if !state.shut_down {
            state.shut_down = true;
            info!(
                pool = %shared.config.name,
                active = state.active,
                queued = state.queue.len(),
                "Thread pool shutting down"
            );
        }
        shared.task_ready.notify_all();
        shared.slot_free.notify_all();

        if wait_for_workers(shared, &mut state, deadline) {
            info!(pool = %shared.config.name, "Thread pool drained");
            return true;
        }

        let abandoned: Vec<Task> = state.queue.drain(..).collect();
        warn!(
            pool = %shared.config.name,
            active = state.active,
            abandoned = abandoned.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Stop timeout elapsed, cancelling in-flight tasks"
        );
        shared.cancel.cancel();

        let drained = wait_for_workers(shared, &mut state, Instant::now() + FORCED_STOP_GRACE);
        if !drained {
            warn!(
                pool = %shared.config.name,
                threads = state.threads,
                "Worker threads still busy after cancellation, detaching them"
            );
        }
        drop(state);
        drop(abandoned);
        false
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shut_down
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let state = shared.state.lock();
        PoolStats {
            threads: state.threads,
            idle: state.idle,
            active: state.active,
            queued: state.queue.len(),
            queue_capacity: shared.config.queue_capacity,
            max_threads: shared.config.max_threads,
            submitted: shared.counters.submitted.load(Ordering::Relaxed),
            completed: shared.counters.completed.load(Ordering::Relaxed),
            rejected: shared.counters.rejected.load(Ordering::Relaxed),
            panicked: shared.counters.panicked.load(Ordering::Relaxed),
            cancelled: shared.counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BoundedThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedThreadPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn wait_for_workers(
    shared: &Shared,
    state: &mut MutexGuard<'_, PoolState>,
    deadline: Instant,
) -> bool {
    while state.threads > 0 {
        if shared.terminated.wait_until(state, deadline).timed_out() {
            return state.threads == 0;
        }
    }
    true
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) -> Result<(), PoolError> {
    state.next_worker_id += 1;
    let name = format!("{}-{}", shared.config.name, state.next_worker_id);
    let worker = Arc::clone(shared);

    thread::Builder::new()
        .name(name)
        .spawn(move || worker.run())
        .map_err(|e| PoolError::Spawn {
            reason: e.to_string(),
        })?;

    state.threads += 1;
    Ok(())
}

impl Shared {
    fn enqueue(&self, state: &mut PoolState, task: Task) {
        state.queue.push_back(task);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.task_ready.notify_one();
    }

    /// Worker thread body.
    fn run(self: Arc<Self>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(pool = %self.config.name, error = %e, "Failed to build worker runtime");
                let mut state = self.state.lock();
                self.retire(&mut state);
                return;
            }
        };

        debug!(pool = %self.config.name, "Worker started");
        while let Some(task) = self.next_task() {
            self.execute(&runtime, task);
        }
        debug!(pool = %self.config.name, "Worker exited");
    }

    /// Blocks until a task is available. Returns `None` once this worker
    /// should exit, after removing it from the thread count.
    fn next_task(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                state.active += 1;
                self.slot_free.notify_one();
                return Some(task);
            }

            if state.shut_down {
                self.retire(&mut state);
                return None;
            }

            state.idle += 1;
            let timed_out = self
                .task_ready
                .wait_for(&mut state, self.config.idle_timeout)
                .timed_out();
            state.idle -= 1;

            if timed_out && state.queue.is_empty() && state.threads > self.config.min_threads {
                self.retire(&mut state);
                return None;
            }
        }
    }

    fn execute(&self, runtime: &Runtime, task: Task) {
        let cancel = self.cancel.clone();
        let outcome = runtime.block_on(async move {
            tokio::select! {
                result = AssertUnwindSafe(task).catch_unwind() => Some(result),
                _ = cancel.cancelled() => None,
            }
        });

        match outcome {
            Some(Ok(())) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(panic)) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    pool = %self.config.name,
                    thread = thread::current().name().unwrap_or("unnamed"),
                    panic = %panic_message(panic.as_ref()),
                    "Uncaught panic in worker task"
                );
            }
            None => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.config.name, "Task cancelled by forced shutdown");
            }
        }

        self.state.lock().active -= 1;
    }

    fn retire(&self, state: &mut PoolState) {
        state.threads -= 1;
        if state.threads == 0 {
            self.terminated.notify_all();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
