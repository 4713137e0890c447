//! The scheduling unit owning a cache and a set of engine replicas for
//! one configuration fingerprint.
//!
//! A dedicated consumer thread bridges the cache to the engines: it pops
//! packages, waits for an idle engine, and submits the first pipeline
//! stage to the device pool at the package's priority. Each engine
//! handles one package at a time end to end; parallelism comes from the
//! replica count.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::{Engine, IdleNotify, Processor};
use crate::request::{CompletionFn, Package, RequestControl};
use crate::scheduler::{create_cache, BatchStrategy, PackageCache, PriorityThreadPool};
use crate::session::SessionDescriptor;
use crate::Status;

/// Errors raised while constructing an executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to spawn consumer thread: {0}")]
    Spawn(String),
}

/// Requests currently owned by the pipeline, keyed by request id.
struct InflightTable {
    map: Mutex<HashMap<u64, Arc<RequestControl>>>,
    cond: Condvar,
}

impl InflightTable {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    fn insert(&self, id: u64, ctrl: Arc<RequestControl>) {
        self.map.lock().unwrap().insert(id, ctrl);
    }

    fn remove_and_notify(&self, id: u64) {
        let mut map = self.map.lock().unwrap();
        map.remove(&id);
        drop(map);
        self.cond.notify_all();
    }

    fn remove_silent(&self, id: u64) {
        self.map.lock().unwrap().remove(&id);
    }

    fn wait_tag(&self, tag: &str) {
        let mut map = self.map.lock().unwrap();
        while map.values().any(|ctrl| ctrl.tag() == Some(tag)) {
            map = self.cond.wait(map).unwrap();
        }
    }

    fn discard_tag(&self, tag: &str) -> bool {
        let map = self.map.lock().unwrap();
        let mut any = false;
        for ctrl in map.values() {
            if ctrl.tag() == Some(tag) {
                ctrl.discard();
                any = true;
            }
        }
        any
    }

    fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

struct ExecutorShared {
    cache: Box<dyn PackageCache>,
    engines: Vec<Engine>,
    idle: Arc<IdleNotify>,
    pool: Arc<PriorityThreadPool>,
}

/// Owns the cache, engines, and consumer thread for one fingerprint.
///
/// Co-owned by its linked sessions and the server directory; dropping
/// the last handle stops the cache, drains the engines, and joins the
/// consumer. Destruction therefore completes only after every
/// outstanding request has finished.
pub struct Executor {
    name: String,
    device_id: i32,
    engine_num: usize,
    strategy: BatchStrategy,
    shared: Arc<ExecutorShared>,
    inflight: Arc<InflightTable>,
    request_seq: AtomicU64,
    sessions: Mutex<HashSet<u64>>,
    consumer: Option<JoinHandle<()>>,
}

impl Executor {
    pub(crate) fn new(
        desc: SessionDescriptor,
        pool: Arc<PriorityThreadPool>,
        device_id: i32,
    ) -> Result<Self, ExecutorError> {
        let SessionDescriptor {
            name,
            model,
            strategy,
            preproc,
            predictor,
            postproc,
            batch_timeout_ms,
            priority_base,
            engine_num,
            cache_capacity,
            batch_size,
            ..
        } = desc;

        let engine_num = engine_num.max(1);
        let batch_size = batch_size.unwrap_or_else(|| model.batch_size()).max(1);

        let mut chain: Vec<Box<dyn Processor>> = Vec::with_capacity(3);
        chain.push(preproc);
        if let Some(p) = predictor {
            chain.push(p);
        }
        chain.push(postproc);

        let idle = Arc::new(IdleNotify::new());
        let first = Engine::new(chain, &pool, &idle);
        let forks: Vec<Engine> = (1..engine_num).map(|_| first.fork(&pool, &idle)).collect();
        let mut engines = Vec::with_capacity(engine_num);
        engines.push(first);
        engines.extend(forks);

        let cache = create_cache(
            strategy,
            cache_capacity,
            batch_size,
            priority_base,
            Duration::from_millis(batch_timeout_ms),
        );

        let shared = Arc::new(ExecutorShared {
            cache,
            engines,
            idle,
            pool,
        });
        let consumer_shared = Arc::clone(&shared);
        let consumer_name = name.clone();
        let consumer = thread::Builder::new()
            .name("infer-consumer".to_string())
            .spawn(move || consumer_loop(consumer_shared, consumer_name))
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?;

        tracing::info!(executor = %name, device_id, engine_num, batch_size, "executor created");
        Ok(Self {
            name,
            device_id,
            engine_num,
            strategy,
            shared,
            inflight: Arc::new(InflightTable::new()),
            request_seq: AtomicU64::new(0),
            sessions: Mutex::new(HashSet::new()),
            consumer: Some(consumer),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub(crate) fn engine_num(&self) -> usize {
        self.engine_num
    }

    pub(crate) fn strategy(&self) -> BatchStrategy {
        self.strategy
    }

    /// Register a request and wrap its completion so the in-flight table
    /// forgets it and wakes tag waiters.
    pub(crate) fn create_control(
        &self,
        expected: usize,
        tag: Option<String>,
        user_done: CompletionFn,
    ) -> Arc<RequestControl> {
        let id = self.request_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let table = Arc::clone(&self.inflight);
        let callback: CompletionFn = Box::new(move |status, output| {
            user_done(status, output);
            table.remove_and_notify(id);
        });
        let ctrl = Arc::new(RequestControl::new(id, expected, tag, callback));
        self.inflight.insert(id, Arc::clone(&ctrl));
        ctrl
    }

    /// Forget a control whose package never entered the cache. Its
    /// callback is dropped unfired.
    pub(crate) fn abandon_control(&self, id: u64) {
        self.inflight.remove_silent(id);
    }

    pub(crate) fn submit(&self, pkg: Package) -> bool {
        self.shared.cache.push(pkg)
    }

    pub(crate) fn wait_if_cache_full(&self, timeout: Option<Duration>) -> bool {
        self.shared.cache.wait_if_full(timeout)
    }

    /// Block until no in-flight request carries `tag`.
    pub fn wait_task_done(&self, tag: &str) {
        self.inflight.wait_tag(tag);
    }

    /// Flag every in-flight request carrying `tag` for cooperative
    /// cancellation and wake the cache so queued work is purged.
    pub fn discard_task(&self, tag: &str) {
        if self.inflight.discard_tag(tag) {
            self.shared.cache.wake();
        }
    }

    pub(crate) fn link(&self, session_id: u64) {
        self.sessions.lock().unwrap().insert(session_id);
    }

    pub(crate) fn unlink(&self, session_id: u64) {
        self.sessions.lock().unwrap().remove(&session_id);
    }

    pub fn session_num(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        tracing::info!(executor = %self.name, "destroying executor");
        // Stop admitting and let the consumer drain what is queued.
        self.shared.cache.stop();
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
        // Wait for every engine to finish its outstanding package.
        let mut guard = self.shared.idle.mutex.lock().unwrap();
        while self.shared.engines.iter().any(|e| !e.is_idle()) {
            guard = self.shared.idle.cond.wait(guard).unwrap();
        }
        drop(guard);
        let remaining = self.inflight.len();
        if remaining > 0 {
            tracing::warn!(
                executor = %self.name,
                remaining,
                "executor destroyed with unfinished requests"
            );
        }
    }
}

fn consumer_loop(shared: Arc<ExecutorShared>, name: String) {
    tracing::debug!(executor = %name, "consumer thread started");
    let mut rr = 0usize;
    while let Some(pkg) = shared.cache.pop() {
        let idx = pick_idle_engine(&shared, &mut rr);
        let engine = &shared.engines[idx];
        engine.begin_task();
        let node = match engine.first_node() {
            Some(node) => node,
            None => {
                // Unreachable with a validated descriptor.
                for desc in &pkg.descs {
                    desc.ctrl.process_failed(Status::ErrorBackend);
                }
                engine.release_task();
                continue;
            }
        };
        let descs = pkg.descs.clone();
        let priority = pkg.priority();
        if let Err(e) = shared.pool.push(priority, Box::new(move || node.run(pkg))) {
            tracing::error!(executor = %name, error = %e, "dispatch failed, failing request units");
            for desc in &descs {
                desc.ctrl.process_failed(Status::ErrorBackend);
            }
            engine.release_task();
        }
    }
    tracing::debug!(executor = %name, "consumer thread exiting");
}

/// Round-robin over engines, taking the first idle one; blocks on the
/// idle condvar until an engine frees up.
fn pick_idle_engine(shared: &ExecutorShared, rr: &mut usize) -> usize {
    let engine_count = shared.engines.len();
    let mut guard = shared.idle.mutex.lock().unwrap();
    loop {
        for offset in 0..engine_count {
            let idx = (*rr + offset) % engine_count;
            if shared.engines[idx].is_idle() {
                *rr = (idx + 1) % engine_count;
                return idx;
            }
        }
        guard = shared.idle.cond.wait(guard).unwrap();
    }
}
