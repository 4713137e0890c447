//! One pipeline stage bound to one processor instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::Processor;
use crate::request::Package;
use crate::scheduler::PriorityThreadPool;
use crate::Status;

/// Runs when a package reaches its terminal point on this engine, i.e.
/// tail-stage completion or failure at any stage.
pub(crate) type DoneNotifier = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct TaskNode {
    // Processors declare themselves reentrant-unsafe; the lock grants
    // each invocation exclusive access.
    processor: Mutex<Box<dyn Processor>>,
    next: Option<Arc<TaskNode>>,
    pool: Arc<PriorityThreadPool>,
    done: DoneNotifier,
}

impl TaskNode {
    pub(crate) fn new(
        processor: Box<dyn Processor>,
        pool: Arc<PriorityThreadPool>,
        done: DoneNotifier,
        next: Option<Arc<TaskNode>>,
    ) -> Self {
        Self {
            processor: Mutex::new(processor),
            next,
            pool,
            done,
        }
    }

    pub(crate) fn fork_processor(&self) -> Box<dyn Processor> {
        self.processor.lock().unwrap().fork()
    }

    /// Execute this stage and either forward the package or complete it.
    pub(crate) fn run(&self, mut pkg: Package) {
        let (status, type_name) = {
            let mut processor = self.processor.lock().unwrap();
            let start = Instant::now();
            let status = processor.process(&mut pkg);
            let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;
            let name = processor.type_name().to_string();
            *pkg.perf.entry(name.clone()).or_insert(0.0) += elapsed_ms;
            (status, name)
        };

        if !status.is_success() {
            tracing::error!(processor = %type_name, status = %status, "processor execution failed");
            for desc in &pkg.descs {
                desc.ctrl.process_failed(status);
            }
            (self.done)();
            return;
        }
        self.transmit(pkg);
    }

    fn transmit(&self, mut pkg: Package) {
        match &self.next {
            Some(next) => {
                // Refine the key so this package stays ahead of work
                // that has not progressed as far.
                pkg.priority = pkg.priority.next();
                let priority = pkg.priority;
                let node = Arc::clone(next);
                let descs = pkg.descs.clone();
                if let Err(e) = self.pool.push(priority, Box::new(move || node.run(pkg))) {
                    tracing::error!(error = %e, "failed to submit package to next stage");
                    for desc in &descs {
                        desc.ctrl.process_failed(Status::ErrorBackend);
                    }
                    (self.done)();
                }
            }
            None => {
                // Tail of the chain: report per-unit results in index
                // order, with per-unit average stage times.
                let per_unit = pkg.descs.len().max(1) as f64;
                let perf: HashMap<String, f64> = pkg
                    .perf
                    .iter()
                    .map(|(name, total)| (name.clone(), total / per_unit))
                    .collect();
                let mut data = std::mem::take(&mut pkg.data).into_iter();
                for desc in &pkg.descs {
                    match data.next() {
                        Some(unit) => {
                            desc.ctrl
                                .process_done(Status::Success, unit, desc.index, &perf);
                        }
                        None => desc.ctrl.process_failed(Status::ErrorBackend),
                    }
                }
                (self.done)();
            }
        }
    }
}
