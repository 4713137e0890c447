//! The pipeline: processor contract, per-stage task nodes, and the
//! engine replicas an executor dispatches onto.

mod node;
mod processor;

pub use processor::Processor;
pub(crate) use node::{DoneNotifier, TaskNode};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::scheduler::PriorityThreadPool;

/// Condvar an executor's consumer blocks on until an engine goes idle.
pub(crate) struct IdleNotify {
    pub(crate) mutex: Mutex<()>,
    pub(crate) cond: Condvar,
}

impl IdleNotify {
    pub(crate) fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }
}

/// A linear instantiation of the processor chain.
///
/// An executor holds several engines; each processes one package at a
/// time end to end, so stateful processors observe requests in order.
/// Parallelism comes from replicas created with [`Engine::fork`].
pub(crate) struct Engine {
    nodes: Vec<Arc<TaskNode>>,
    task_num: Arc<AtomicUsize>,
    done: DoneNotifier,
}

impl Engine {
    pub(crate) fn new(
        processors: Vec<Box<dyn Processor>>,
        pool: &Arc<PriorityThreadPool>,
        idle: &Arc<IdleNotify>,
    ) -> Self {
        let task_num = Arc::new(AtomicUsize::new(0));
        let done = make_done_notifier(&task_num, idle);
        let nodes = build_chain(processors, pool, &done);
        Self {
            nodes,
            task_num,
            done,
        }
    }

    /// Clone the chain by forking each processor. Processor impls decide
    /// which state the fork shares (weights) and which it owns (streams,
    /// sequence state).
    pub(crate) fn fork(&self, pool: &Arc<PriorityThreadPool>, idle: &Arc<IdleNotify>) -> Self {
        let processors: Vec<Box<dyn Processor>> =
            self.nodes.iter().map(|n| n.fork_processor()).collect();
        Self::new(processors, pool, idle)
    }

    pub(crate) fn first_node(&self) -> Option<Arc<TaskNode>> {
        self.nodes.first().cloned()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.task_num.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn begin_task(&self) {
        self.task_num.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo `begin_task` when dispatch itself failed.
    pub(crate) fn release_task(&self) {
        (self.done)();
    }
}

fn make_done_notifier(task_num: &Arc<AtomicUsize>, idle: &Arc<IdleNotify>) -> DoneNotifier {
    let task_num = Arc::clone(task_num);
    let idle = Arc::clone(idle);
    Arc::new(move || {
        // Decrement under the idle lock so a waiting consumer cannot
        // miss the wakeup.
        let _guard = idle.mutex.lock().unwrap();
        task_num.fetch_sub(1, Ordering::SeqCst);
        idle.cond.notify_all();
    })
}

fn build_chain(
    processors: Vec<Box<dyn Processor>>,
    pool: &Arc<PriorityThreadPool>,
    done: &DoneNotifier,
) -> Vec<Arc<TaskNode>> {
    let mut next: Option<Arc<TaskNode>> = None;
    let mut nodes: Vec<Arc<TaskNode>> = Vec::with_capacity(processors.len());
    for processor in processors.into_iter().rev() {
        let node = Arc::new(TaskNode::new(
            processor,
            Arc::clone(pool),
            Arc::clone(done),
            next.take(),
        ));
        next = Some(Arc::clone(&node));
        nodes.push(node);
    }
    nodes.reverse();
    nodes
}
