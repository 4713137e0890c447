//! Priority-ordered worker pool.
//!
//! A single queue ordered by [`Priority`] feeds a resizable set of
//! worker threads. Scheduling is strict: the smallest key runs first,
//! ties break FIFO. An optional per-worker init hook runs once before a
//! worker consumes jobs (used to bind device contexts).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use super::priority::Priority;

/// A unit of work for the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Per-worker start hook. Must return `true` before the worker may
/// consume jobs; `false` marks the worker dead.
pub type WorkerInitHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Errors for pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("thread pool is shut down")]
    Shutdown,
}

struct QueuedJob {
    priority: Priority,
    fifo: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.fifo == other.fifo
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // BinaryHeap is a max-heap: the greatest element is the most urgent,
    // i.e. the smallest priority key and the earliest submission.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.fifo.cmp(&self.fifo))
    }
}

struct PoolState {
    heap: BinaryHeap<QueuedJob>,
    target: usize,
    shutdown: bool,
    fifo_seq: u64,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
    init_hook: Option<WorkerInitHook>,
    alive: AtomicUsize,
    busy: AtomicUsize,
}

/// Fixed-capacity, resizable worker pool executing jobs strictly in
/// priority order.
pub struct PriorityThreadPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

impl PriorityThreadPool {
    /// Create an empty pool. Workers are added with [`resize`].
    ///
    /// [`resize`]: PriorityThreadPool::resize
    pub fn new(init_hook: Option<WorkerInitHook>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    heap: BinaryHeap::new(),
                    target: 0,
                    shutdown: false,
                    fifo_seq: 0,
                }),
                available: Condvar::new(),
                init_hook,
                alive: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
            }),
            handles: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    /// Enqueue a job at the given priority.
    ///
    /// Refuses after shutdown; a queued job is never dropped silently.
    pub fn push(&self, priority: Priority, job: Job) -> Result<(), PoolError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Err(PoolError::Shutdown);
            }
            let fifo = state.fifo_seq;
            state.fifo_seq += 1;
            state.heap.push(QueuedJob { priority, fifo, job });
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Grow or shrink the pool to `n` workers.
    ///
    /// Shrinking never cancels an executing job; surplus workers exit as
    /// they go idle.
    pub fn resize(&self, n: usize) {
        let to_spawn = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.target = n;
            let alive = self.shared.alive.load(Ordering::SeqCst);
            if n > alive {
                n - alive
            } else {
                0
            }
        };
        if to_spawn == 0 {
            self.shared.available.notify_all();
            return;
        }
        for _ in 0..to_spawn {
            self.spawn_worker();
        }
    }

    /// Number of live workers.
    pub fn size(&self) -> usize {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Number of live workers not currently executing a job.
    pub fn idle_number(&self) -> usize {
        let alive = self.shared.alive.load(Ordering::SeqCst);
        let busy = self.shared.busy.load(Ordering::SeqCst);
        alive.saturating_sub(busy)
    }

    /// Signal shutdown and join every worker. Queued jobs finish first.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.available.notify_all();
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    fn spawn_worker(&self) {
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        shared.alive.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("infer-worker-{id}"))
            .spawn(move || worker_loop(shared, id));
        match spawned {
            Ok(handle) => self.handles.lock().unwrap().push(handle),
            Err(e) => {
                self.shared.alive.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(worker = id, error = %e, "failed to spawn pool worker");
            }
        }
    }
}

impl Drop for PriorityThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>, id: usize) {
    if let Some(hook) = shared.init_hook.as_ref() {
        if !hook() {
            tracing::error!(worker = id, "worker init hook failed, worker marked dead");
            let _state = shared.state.lock().unwrap();
            shared.alive.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    }

    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown && state.heap.is_empty() {
            break;
        }
        // Surplus workers leave once idle after a shrink.
        if shared.alive.load(Ordering::SeqCst) > state.target && !state.shutdown {
            break;
        }
        if let Some(queued) = state.heap.pop() {
            drop(state);
            shared.busy.fetch_add(1, Ordering::SeqCst);
            (queued.job)();
            shared.busy.fetch_sub(1, Ordering::SeqCst);
            state = shared.state.lock().unwrap();
            continue;
        }
        state = shared.available.wait(state).unwrap();
    }
    shared.alive.fetch_sub(1, Ordering::SeqCst);
}
