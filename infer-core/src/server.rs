//! Process-level directory of executors, one instance per device.
//!
//! Each device instance owns the priority pool shared by its executors;
//! the per-worker init hook binds the device context before a worker
//! consumes jobs. Executors are deduplicated on the descriptor
//! fingerprint and torn down when their last session unlinks, shrinking
//! the pool back if enough workers are idle.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::config;
use crate::executor::Executor;
use crate::models::{Model, ModelError, ModelManager};
use crate::request::{Package, UserData};
use crate::scheduler::{PriorityThreadPool, WorkerInitHook};
use crate::session::{Observer, Session, SessionDescriptor};
use crate::Status;

thread_local! {
    static BOUND_DEVICE: Cell<Option<i32>> = Cell::new(None);
}

/// Bind the calling worker thread to a device context.
fn bind_device(device_id: i32) -> bool {
    BOUND_DEVICE.with(|cell| cell.set(Some(device_id)));
    tracing::trace!(device_id, "worker bound to device");
    true
}

/// Device the calling thread was bound to, if any.
pub fn bound_device() -> Option<i32> {
    BOUND_DEVICE.with(|cell| cell.get())
}

fn valid_device(device_id: i32) -> bool {
    device_id >= 0 && (device_id as usize) < config::load().device_num
}

struct ServerInstance {
    device_id: i32,
    pool: Arc<PriorityThreadPool>,
    executors: Mutex<HashMap<String, Arc<Executor>>>,
    session_seq: AtomicU64,
    // Serializes grow/shrink decisions against concurrent session churn.
    pool_guard: Mutex<()>,
}

impl ServerInstance {
    fn new(device_id: i32) -> Self {
        config::load().log_effective();
        let hook: WorkerInitHook = Arc::new(move || bind_device(device_id));
        Self {
            device_id,
            pool: Arc::new(PriorityThreadPool::new(Some(hook))),
            executors: Mutex::new(HashMap::new()),
            session_seq: AtomicU64::new(0),
            pool_guard: Mutex::new(()),
        }
    }
}

static SERVERS: OnceLock<Mutex<HashMap<i32, Arc<ServerInstance>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<i32, Arc<ServerInstance>>> {
    SERVERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Entry point to the serving runtime for one device.
pub struct InferServer {
    inst: Arc<ServerInstance>,
}

impl InferServer {
    /// Attach to the (lazily created) instance for `device_id`. Returns
    /// `None` for an invalid device.
    pub fn new(device_id: i32) -> Option<Self> {
        if !valid_device(device_id) {
            tracing::error!(device_id, "invalid device id");
            return None;
        }
        let mut servers = registry().lock().unwrap();
        let inst = servers
            .entry(device_id)
            .or_insert_with(|| Arc::new(ServerInstance::new(device_id)));
        Some(Self {
            inst: Arc::clone(inst),
        })
    }

    /// Create a session, reusing the executor whose fingerprint matches
    /// the descriptor or building a fresh one. Async when an observer is
    /// supplied, sync otherwise.
    pub fn create_session(
        &self,
        mut desc: SessionDescriptor,
        observer: Option<Arc<dyn Observer>>,
    ) -> Option<Session> {
        let fingerprint = desc.fingerprint();
        let session_name = desc.name.clone();
        let engine_num = desc.engine_num.max(1);
        let show_perf = desc.show_perf;

        let mut grew = false;
        let executor = {
            let mut executors = self.inst.executors.lock().unwrap();
            if let Some(existing) = executors.get(&fingerprint) {
                tracing::debug!(executor = %fingerprint, "reusing executor");
                Arc::clone(existing)
            } else {
                desc.name = fingerprint.clone();
                let executor =
                    match Executor::new(desc, Arc::clone(&self.inst.pool), self.inst.device_id) {
                        Ok(executor) => Arc::new(executor),
                        Err(e) => {
                            tracing::error!(executor = %fingerprint, error = %e, "failed to create executor");
                            return None;
                        }
                    };
                executors.insert(fingerprint.clone(), Arc::clone(&executor));
                grew = true;
                executor
            }
        };

        if grew {
            // Grow the device pool to fit the new engines, capped.
            let _guard = self.inst.pool_guard.lock().unwrap();
            let ceiling = config::load().pool_ceiling();
            let size = self.inst.pool.size();
            if size < ceiling {
                self.inst.pool.resize((size + 3 * engine_num).min(ceiling));
            }
        }

        let id = self.inst.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Session::new(id, session_name, Arc::clone(&executor), observer, show_perf);
        executor.link(id);
        tracing::debug!(session = %session.name(), executor = %executor.name(), "session linked");
        Some(session)
    }

    /// Unlink and consume a session, tearing down the executor when its
    /// last session leaves. The teardown drains all outstanding work.
    pub fn destroy_session(&self, session: Session) -> bool {
        let (id, executor) = session.into_parts();
        let name = executor.name().to_string();
        let engine_num = executor.engine_num();

        let last = {
            let mut executors = self.inst.executors.lock().unwrap();
            executor.unlink(id);
            if executor.session_num() == 0 {
                if executors.remove(&name).is_none() {
                    tracing::warn!(executor = %name, "session does not belong to this server");
                    return false;
                }
                true
            } else {
                false
            }
        };

        if last {
            // Last Arc: blocks here until the executor has drained.
            drop(executor);
            let _guard = self.inst.pool_guard.lock().unwrap();
            let shrink = 2 * engine_num;
            if self.inst.pool.idle_number() >= shrink {
                let size = self.inst.pool.size();
                self.inst.pool.resize(size.saturating_sub(shrink));
            }
        }
        true
    }

    /// Asynchronous submission. Results arrive through the session's
    /// observer, once per input unit.
    pub fn request(
        &self,
        session: &Session,
        input: Package,
        user_data: UserData,
        timeout_ms: Option<u64>,
    ) -> Result<(), Status> {
        if session.is_sync_link() {
            tracing::error!(session = %session.name(), "sync session used with the async api");
            return Err(Status::WrongType);
        }
        if input.is_empty() {
            return Err(Status::InvalidParam);
        }
        if !session
            .executor()
            .wait_if_cache_full(timeout_ms.map(Duration::from_millis))
        {
            tracing::warn!(session = %session.name(), "session is busy, request timed out");
            return Err(Status::Timeout);
        }
        session.send_async(input, user_data)
    }

    /// Blocking submission. The timeout covers the whole request,
    /// including any wait for cache space.
    pub fn request_sync(
        &self,
        session: &Session,
        input: Package,
        timeout_ms: Option<u64>,
    ) -> Result<Package, Status> {
        if !session.is_sync_link() {
            tracing::error!(session = %session.name(), "async session used with the sync api");
            return Err(Status::WrongType);
        }
        if input.is_empty() {
            return Err(Status::InvalidParam);
        }

        let wait_start = Instant::now();
        if !session
            .executor()
            .wait_if_cache_full(timeout_ms.map(Duration::from_millis))
        {
            tracing::warn!(session = %session.name(), "session is busy, request timed out");
            return Err(Status::Timeout);
        }
        let remaining = timeout_ms.map(|ms| {
            let waited = wait_start.elapsed().as_millis() as u64;
            ms.saturating_sub(waited)
        });
        if remaining == Some(0) {
            return Err(Status::Timeout);
        }
        session.send_sync(input, remaining)
    }

    /// Block until every in-flight request with `tag` has completed.
    pub fn wait_task_done(&self, session: &Session, tag: &str) {
        session.executor().wait_task_done(tag);
    }

    /// Flag every in-flight request with `tag` as discarded.
    pub fn discard_task(&self, session: &Session, tag: &str) {
        session.executor().discard_task(tag);
    }

    pub fn load_model(&self, uri: &str, function_name: &str) -> Result<Arc<Model>, ModelError> {
        ModelManager::instance().load(uri, function_name)
    }

    pub fn load_model_mem(&self, tag: &str, function_name: &str) -> Arc<Model> {
        ModelManager::instance().load_mem(tag, function_name)
    }

    pub fn unload_model(&self, model: &Arc<Model>) -> bool {
        ModelManager::instance().unload(model)
    }

    pub fn clear_model_cache(&self) {
        ModelManager::instance().clear_cache();
    }

    pub fn set_model_dir(&self, dir: &str) -> bool {
        ModelManager::instance().set_model_dir(dir)
    }

    /// Number of live executors on this device.
    pub fn executor_num(&self) -> usize {
        self.inst.executors.lock().unwrap().len()
    }

    /// Current size of this device's worker pool.
    pub fn worker_num(&self) -> usize {
        self.inst.pool.size()
    }

    /// Workers currently idle in this device's pool.
    pub fn idle_worker_num(&self) -> usize {
        self.inst.pool.idle_number()
    }

    /// Tear down every device instance. Intended for tests; callers must
    /// have destroyed their sessions first.
    pub fn shutdown() {
        if let Some(servers) = SERVERS.get() {
            let mut map = servers.lock().unwrap();
            for (device_id, inst) in map.drain() {
                let live = inst.executors.lock().unwrap().len();
                if live > 0 {
                    tracing::warn!(device_id, executors = live, "shutting down with live executors");
                }
                inst.pool.shutdown();
            }
        }
    }
}
