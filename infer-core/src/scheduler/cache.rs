//! Bounded package queue feeding each executor's consumer thread.
//!
//! Two batching strategies share one queue core. The dynamic cache
//! regroups incoming units into hardware-preferred batches under a
//! timeout; the static cache preserves the caller's batch structure,
//! slicing oversized packages. Both purge cooperatively-cancelled work
//! before it reaches the pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::batcher::Batcher;
use super::priority::Priority;
use crate::request::{InferData, Package, TaskDesc};
use crate::Status;

/// How an executor groups request units into packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// Regroup units across requests into `batch_size` packages under a
    /// timeout. Continuous input is not supported.
    Dynamic,
    /// Keep the caller's batches, slicing any package larger than
    /// `batch_size`.
    Static,
}

pub(crate) struct CacheCore {
    queue: Mutex<VecDeque<Package>>,
    cond: Condvar,
    capacity: usize,
    batch_size: usize,
    base_priority: i16,
    running: AtomicBool,
}

impl CacheCore {
    fn new(capacity: usize, batch_size: usize, base_priority: i16) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            capacity: capacity.max(1),
            batch_size: batch_size.max(1),
            base_priority,
            running: AtomicBool::new(true),
        }
    }

    fn append(&self, pkg: Package) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(pkg);
        drop(queue);
        self.cond.notify_all();
    }
}

fn unit_discarded(unit: &InferData) -> bool {
    unit.desc().map_or(false, |d| d.ctrl.is_discarded())
}

fn package_from_units(core: &CacheCore, units: Vec<InferData>) -> Package {
    let request_id = units
        .first()
        .and_then(|u| u.desc())
        .map(|d| d.ctrl.request_id())
        .unwrap_or(0);
    let mut pkg = Package::from_data(units);
    pkg.priority = Priority::new(core.base_priority, request_id);
    pkg
}

/// Bounded priority-stamped FIFO of packages.
///
/// `pop` blocks until a package is available, purging discarded work
/// first, and returns `None` only once the cache is stopped and
/// drained — the consumer-exit sentinel.
pub(crate) trait PackageCache: Send + Sync {
    fn core(&self) -> &CacheCore;

    /// Strategy-specific admission of an inbound package.
    fn enqueue(&self, pkg: Package);

    /// Strategy-specific fixup of a package leaving the cache.
    fn prepare(&self, pkg: &mut Package);

    /// Purge discarded work from the queue, completing discarded units
    /// with `Status::Success`.
    fn clear_discard(&self, queue: &mut VecDeque<Package>);

    fn push(&self, pkg: Package) -> bool {
        if !self.core().running.load(Ordering::Acquire) {
            return false;
        }
        self.enqueue(pkg);
        true
    }

    fn pop(&self) -> Option<Package> {
        let core = self.core();
        let mut queue = core.queue.lock().unwrap();
        loop {
            let head_discarded = queue.front().map(|pkg| pkg.data.iter().any(unit_discarded));
            match head_discarded {
                Some(true) => {
                    self.clear_discard(&mut queue);
                }
                Some(false) => {
                    let mut pkg = match queue.pop_front() {
                        Some(pkg) => pkg,
                        None => continue,
                    };
                    drop(queue);
                    core.cond.notify_all();
                    self.prepare(&mut pkg);
                    return Some(pkg);
                }
                None => {
                    if !core.running.load(Ordering::Acquire) {
                        return None;
                    }
                    queue = core.cond.wait(queue).unwrap();
                }
            }
        }
    }

    /// Block while the cache holds `capacity` packages. Returns `false`
    /// only when the timeout expires first.
    fn wait_if_full(&self, timeout: Option<Duration>) -> bool {
        let core = self.core();
        let mut queue = core.queue.lock().unwrap();
        match timeout {
            Some(t) => {
                let deadline = Instant::now() + t;
                while queue.len() >= core.capacity && core.running.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = core.cond.wait_timeout(queue, deadline - now).unwrap();
                    queue = guard;
                }
                true
            }
            None => {
                while queue.len() >= core.capacity && core.running.load(Ordering::Acquire) {
                    queue = core.cond.wait(queue).unwrap();
                }
                true
            }
        }
    }

    fn stop(&self) {
        self.core().running.store(false, Ordering::Release);
        self.core().cond.notify_all();
    }

    /// Wake blocked waiters, e.g. after flagging requests discarded.
    fn wake(&self) {
        self.core().cond.notify_all();
    }

    fn len(&self) -> usize {
        self.core().queue.lock().unwrap().len()
    }
}

/// Cache that regroups arriving units into `batch_size` packages under a
/// timeout, via a [`Batcher`].
pub(crate) struct DynamicCache {
    core: Arc<CacheCore>,
    batcher: Batcher<InferData>,
}

impl DynamicCache {
    pub(crate) fn new(
        capacity: usize,
        batch_size: usize,
        base_priority: i16,
        batch_timeout: Duration,
    ) -> Self {
        let core = Arc::new(CacheCore::new(capacity, batch_size, base_priority));
        let emit_core = Arc::clone(&core);
        let batcher = Batcher::new(
            move |units: Vec<InferData>| {
                let pkg = package_from_units(&emit_core, units);
                emit_core.append(pkg);
            },
            batch_timeout,
            batch_size,
        );
        Self { core, batcher }
    }
}

impl PackageCache for DynamicCache {
    fn core(&self) -> &CacheCore {
        &self.core
    }

    fn enqueue(&self, mut pkg: Package) {
        for unit in pkg.data.drain(..) {
            debug_assert!(unit.desc().is_some());
            self.batcher.add_item(unit);
        }
    }

    fn prepare(&self, pkg: &mut Package) {
        // Descriptions travel on the units until the package leaves the
        // cache.
        pkg.descs.clear();
        for unit in &mut pkg.data {
            if let Some(desc) = unit.take_desc() {
                pkg.descs.push(desc);
            }
        }
    }

    fn clear_discard(&self, queue: &mut VecDeque<Package>) {
        tracing::debug!("purging discarded units from dynamic cache");
        let mut kept: Vec<InferData> = Vec::new();
        while let Some(mut pkg) = queue.pop_front() {
            for unit in pkg.data.drain(..) {
                if unit_discarded(&unit) {
                    if let Some(desc) = unit.desc() {
                        desc.ctrl.process_failed(Status::Success);
                    }
                } else {
                    kept.push(unit);
                }
            }
        }
        // Rebatch the survivors into full-size packages.
        let mut chunk: Vec<InferData> = Vec::new();
        for unit in kept {
            chunk.push(unit);
            if chunk.len() >= self.core.batch_size {
                queue.push_back(package_from_units(&self.core, std::mem::take(&mut chunk)));
            }
        }
        if !chunk.is_empty() {
            queue.push_back(package_from_units(&self.core, chunk));
        }
    }

    fn stop(&self) {
        self.core.running.store(false, Ordering::Release);
        // Flush the partial batch so queued units drain before the
        // consumer exits.
        self.batcher.emit_now();
        self.core.cond.notify_all();
    }
}

/// Cache that preserves the caller's batch structure.
pub(crate) struct StaticCache {
    core: CacheCore,
}

impl StaticCache {
    pub(crate) fn new(capacity: usize, batch_size: usize, base_priority: i16) -> Self {
        Self {
            core: CacheCore::new(capacity, batch_size, base_priority),
        }
    }

    fn admit(&self, units: Vec<InferData>, tag: Option<String>) {
        let descs: Vec<TaskDesc> = units.iter().filter_map(|u| u.desc().cloned()).collect();
        let mut sub = package_from_units(&self.core, units);
        sub.descs = descs;
        sub.tag = tag;
        self.core.append(sub);
    }
}

impl PackageCache for StaticCache {
    fn core(&self) -> &CacheCore {
        &self.core
    }

    fn enqueue(&self, pkg: Package) {
        let Package {
            data,
            data_num,
            tag,
            ..
        } = pkg;

        // Continuous input: one unit standing for data_num results, all
        // sharing the same control through synthesized descriptions.
        if data.len() == 1 && data_num > 1 {
            let mut units = data;
            let ctrl = units
                .first()
                .and_then(|u| u.desc())
                .map(|d| Arc::clone(&d.ctrl));
            if let Some(ctrl) = ctrl {
                let unit = match units.pop() {
                    Some(unit) => unit,
                    None => return,
                };
                let mut sub = Package::single(unit);
                sub.data_num = data_num;
                sub.priority = Priority::new(self.core.base_priority, ctrl.request_id());
                sub.descs = (0..data_num)
                    .map(|index| TaskDesc {
                        ctrl: Arc::clone(&ctrl),
                        index,
                    })
                    .collect();
                sub.tag = tag;
                self.core.append(sub);
            } else {
                tracing::error!("continuous package without a description, dropped");
            }
            return;
        }

        // Slice into batch_size sub-packages; the tail may be short.
        let batch_size = self.core.batch_size;
        let mut chunk: Vec<InferData> = Vec::with_capacity(batch_size);
        for unit in data {
            debug_assert!(unit.desc().is_some());
            chunk.push(unit);
            if chunk.len() >= batch_size {
                self.admit(std::mem::take(&mut chunk), tag.clone());
            }
        }
        if !chunk.is_empty() {
            self.admit(chunk, tag);
        }
    }

    fn prepare(&self, pkg: &mut Package) {
        // Descriptions were copied to the package at admission.
        for unit in &mut pkg.data {
            unit.clear_desc();
        }
    }

    fn clear_discard(&self, queue: &mut VecDeque<Package>) {
        tracing::debug!("dropping discarded packages from static cache");
        let mut kept = VecDeque::with_capacity(queue.len());
        while let Some(pkg) = queue.pop_front() {
            let head_discarded = pkg
                .data
                .first()
                .and_then(|u| u.desc())
                .map_or(false, |d| d.ctrl.is_discarded());
            if head_discarded {
                // Complete through the descs so a continuous package
                // reports all of its expected indices.
                for desc in &pkg.descs {
                    desc.ctrl.process_failed(Status::Success);
                }
            } else {
                kept.push_back(pkg);
            }
        }
        *queue = kept;
    }
}

/// Build the cache matching a descriptor's batching strategy.
pub(crate) fn create_cache(
    strategy: BatchStrategy,
    capacity: usize,
    batch_size: usize,
    base_priority: i16,
    batch_timeout: Duration,
) -> Box<dyn PackageCache> {
    match strategy {
        BatchStrategy::Dynamic => Box::new(DynamicCache::new(
            capacity,
            batch_size,
            base_priority,
            batch_timeout,
        )),
        BatchStrategy::Static => Box::new(StaticCache::new(capacity, batch_size, base_priority)),
    }
}
