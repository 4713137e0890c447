//! User-facing request handles.
//!
//! A session is created from a [`SessionDescriptor`] and fixed at
//! construction as either asynchronous (an [`Observer`] was supplied) or
//! synchronous (blocking send with a timeout). Many sessions may share
//! one executor when their descriptors fingerprint identically.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Processor;
use crate::executor::Executor;
use crate::models::Model;
use crate::request::{CompletionFn, InferData, Package, RequestControl, TaskDesc, UserData};
use crate::scheduler::BatchStrategy;
use crate::{config, Status};

/// Receives per-unit results of an asynchronous request.
pub trait Observer: Send + Sync {
    /// Called once per input unit, in index order. A failed unit arrives
    /// as an empty [`InferData`] with the aggregate status; a discarded
    /// request produces no calls at all.
    fn notify(&self, status: Status, output: InferData, user_data: &UserData);
}

/// Everything needed to create (or reuse) an executor and attach a
/// session to it.
///
/// The processor chain runs `preproc -> predictor -> postproc`, with
/// `predictor` optional for chains whose middle stage lives elsewhere.
/// Executors are deduplicated on the fingerprint
/// `"{model_path}_{function_name}_{preproc_type}_{postproc_type}"`.
pub struct SessionDescriptor {
    pub name: String,
    pub model: Arc<Model>,
    pub strategy: BatchStrategy,
    pub preproc: Box<dyn Processor>,
    pub predictor: Option<Box<dyn Processor>>,
    pub postproc: Box<dyn Processor>,
    /// How long the dynamic cache holds a partial batch.
    pub batch_timeout_ms: u64,
    /// Base scheduling priority; smaller is more urgent.
    pub priority_base: i16,
    /// Engine replicas to run in parallel.
    pub engine_num: usize,
    /// Package cache capacity.
    pub cache_capacity: usize,
    /// Override of the model's preferred batch size.
    pub batch_size: Option<usize>,
    /// Surface per-stage wall times through completion callbacks.
    pub show_perf: bool,
}

impl SessionDescriptor {
    /// Descriptor with defaults drawn from the environment
    /// configuration.
    pub fn new(
        name: impl Into<String>,
        model: Arc<Model>,
        preproc: Box<dyn Processor>,
        postproc: Box<dyn Processor>,
    ) -> Self {
        let cfg = config::load();
        Self {
            name: name.into(),
            model,
            strategy: BatchStrategy::Dynamic,
            preproc,
            predictor: None,
            postproc,
            batch_timeout_ms: cfg.batch_timeout_ms,
            priority_base: 0,
            engine_num: cfg.engine_num,
            cache_capacity: cfg.cache_capacity,
            batch_size: None,
            show_perf: false,
        }
    }

    pub(crate) fn fingerprint(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.model.path(),
            self.model.function_name(),
            self.preproc.type_name(),
            self.postproc.type_name()
        )
    }
}

/// Handle through which one user submits requests to an executor.
///
/// Immutable after creation; destroyed through
/// [`InferServer::destroy_session`](crate::InferServer::destroy_session),
/// which consumes the handle.
pub struct Session {
    id: u64,
    name: String,
    executor: Arc<Executor>,
    observer: Option<Arc<dyn Observer>>,
    show_perf: bool,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        name: String,
        executor: Arc<Executor>,
        observer: Option<Arc<dyn Observer>>,
        show_perf: bool,
    ) -> Self {
        Self {
            id,
            name,
            executor,
            observer,
            show_perf,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for sessions created without an observer, i.e. those driven
    /// through the blocking API.
    pub fn is_sync_link(&self) -> bool {
        self.observer.is_none()
    }

    pub fn show_perf(&self) -> bool {
        self.show_perf
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub(crate) fn into_parts(self) -> (u64, Arc<Executor>) {
        (self.id, self.executor)
    }

    /// Hand a package to the executor's cache under a fresh control.
    pub(crate) fn send(
        &self,
        mut pkg: Package,
        done: CompletionFn,
    ) -> Result<Arc<RequestControl>, Status> {
        if pkg.is_empty() {
            tracing::error!(session = %self.name, "empty input package");
            return Err(Status::InvalidParam);
        }
        if pkg.data_num > pkg.data.len() {
            // Continuous input: exactly one unit, static batching only.
            if pkg.data.len() != 1 {
                tracing::error!(session = %self.name, "malformed continuous package");
                return Err(Status::InvalidParam);
            }
            if self.executor.strategy() == BatchStrategy::Dynamic {
                tracing::error!(session = %self.name, "continuous input requires static batching");
                return Err(Status::InvalidParam);
            }
        }

        let expected = pkg.data_num.max(pkg.data.len());
        let ctrl = self.executor.create_control(expected, pkg.tag.clone(), done);
        for (index, unit) in pkg.data.iter_mut().enumerate() {
            unit.set_desc(TaskDesc {
                ctrl: Arc::clone(&ctrl),
                index,
            });
        }
        if !self.executor.submit(pkg) {
            tracing::error!(session = %self.name, "executor is stopped, request rejected");
            self.executor.abandon_control(ctrl.request_id());
            return Err(Status::ErrorBackend);
        }
        Ok(ctrl)
    }

    /// Fire-and-forget submission; results fan out through the observer.
    pub(crate) fn send_async(&self, pkg: Package, user_data: UserData) -> Result<(), Status> {
        let observer = match &self.observer {
            Some(observer) => Arc::clone(observer),
            None => return Err(Status::WrongType),
        };
        let done: CompletionFn = Box::new(move |status, mut output| {
            for unit in output.data.drain(..) {
                observer.notify(status, unit, &user_data);
            }
        });
        self.send(pkg, done).map(|_| ())
    }

    /// Blocking submission. The whole request times out as one: on
    /// expiry the control is discarded, `Timeout` is returned, and the
    /// eventual completion is dropped without reaching the caller.
    pub(crate) fn send_sync(
        &self,
        pkg: Package,
        timeout_ms: Option<u64>,
    ) -> Result<Package, Status> {
        let (tx, rx) = mpsc::channel::<(Status, Package)>();
        let done: CompletionFn = Box::new(move |status, output| {
            let _ = tx.send((status, output));
        });
        let ctrl = self.send(pkg, done)?;

        let (status, output) = match timeout_ms {
            Some(ms) => match rx.recv_timeout(Duration::from_millis(ms)) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        session = %self.name,
                        request_id = ctrl.request_id(),
                        "request timed out, discarding"
                    );
                    ctrl.discard();
                    return Err(Status::Timeout);
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(Status::ErrorBackend),
            },
            None => match rx.recv() {
                Ok(result) => result,
                Err(_) => return Err(Status::ErrorBackend),
            },
        };
        if status.is_success() {
            Ok(output)
        } else {
            Err(status)
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sync", &self.is_sync_link())
            .finish()
    }
}
