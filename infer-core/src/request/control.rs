//! Per-request completion aggregation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::package::{InferData, Package};
use crate::Status;

/// Invoked at most once when every expected unit has reported.
pub(crate) type CompletionFn = Box<dyn FnOnce(Status, Package) + Send>;

struct ControlState {
    completed: usize,
    status: Status,
    slots: Vec<Option<InferData>>,
    perf: HashMap<String, f64>,
    callback: Option<CompletionFn>,
}

/// Tracks one user request across the pipeline.
///
/// Every [`TaskDesc`](super::TaskDesc) referencing the request co-owns
/// the control; the control itself holds no references back. Completion
/// fires exactly once, when the number of reported units reaches the
/// expected count, with the aggregated status (first non-success wins)
/// and the output package reassembled by index. A discarded control
/// completes with an empty output package.
pub struct RequestControl {
    request_id: u64,
    expected: usize,
    tag: Option<String>,
    discarded: AtomicBool,
    state: Mutex<ControlState>,
}

impl RequestControl {
    pub(crate) fn new(
        request_id: u64,
        expected: usize,
        tag: Option<String>,
        callback: CompletionFn,
    ) -> Self {
        debug_assert!(expected > 0);
        let expected = expected.max(1);
        let mut slots = Vec::with_capacity(expected);
        slots.resize_with(expected, || None);
        Self {
            request_id,
            expected,
            tag,
            discarded: AtomicBool::new(false),
            state: Mutex::new(ControlState {
                completed: 0,
                status: Status::Success,
                slots,
                perf: HashMap::new(),
                callback: Some(callback),
            }),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Flag the request for cooperative cancellation. Units still in the
    /// cache are purged at the next pop; work already on the pool runs
    /// to completion with its results dropped.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// True once the completion callback has run.
    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().callback.is_none()
    }

    /// Record the result for one unit. `index` is unique per request
    /// until completion; a `Success` status never overwrites an earlier
    /// failure.
    pub(crate) fn process_done(
        &self,
        status: Status,
        unit: InferData,
        index: usize,
        perf: &HashMap<String, f64>,
    ) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            if state.callback.is_none() {
                tracing::warn!(
                    request_id = self.request_id,
                    index,
                    "unit reported after request completion"
                );
                return;
            }
            merge_status(&mut state.status, status);
            if index < self.expected {
                if state.slots[index].is_some() {
                    tracing::warn!(request_id = self.request_id, index, "duplicate unit index");
                }
                state.slots[index] = Some(unit);
            } else {
                tracing::error!(
                    request_id = self.request_id,
                    index,
                    expected = self.expected,
                    "unit index out of range"
                );
                merge_status(&mut state.status, Status::ErrorBackend);
            }
            for (name, ms) in perf {
                *state.perf.entry(name.clone()).or_insert(0.0) += ms;
            }
            state.completed += 1;
            self.try_take_completion(&mut state)
        };
        if let Some((callback, status, output)) = finished {
            callback(status, output);
        }
    }

    /// Mark one remaining unit as failed. Triggers completion if it was
    /// the last.
    pub(crate) fn process_failed(&self, status: Status) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            if state.callback.is_none() {
                return;
            }
            merge_status(&mut state.status, status);
            state.completed += 1;
            self.try_take_completion(&mut state)
        };
        if let Some((callback, status, output)) = finished {
            callback(status, output);
        }
    }

    fn try_take_completion(
        &self,
        state: &mut ControlState,
    ) -> Option<(CompletionFn, Status, Package)> {
        if state.completed < self.expected {
            return None;
        }
        let callback = state.callback.take()?;
        let data: Vec<InferData> = if self.is_discarded() {
            Vec::new()
        } else {
            state
                .slots
                .drain(..)
                .map(|slot| slot.unwrap_or_else(InferData::empty))
                .collect()
        };
        let mut output = Package::from_data(data);
        output.perf = std::mem::take(&mut state.perf);
        output.tag = self.tag.clone();
        Some((callback, state.status, output))
    }
}

fn merge_status(current: &mut Status, incoming: Status) {
    if current.is_success() && !incoming.is_success() {
        *current = incoming;
    }
}

impl std::fmt::Debug for RequestControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestControl")
            .field("request_id", &self.request_id)
            .field("expected", &self.expected)
            .field("tag", &self.tag)
            .field("discarded", &self.is_discarded())
            .finish()
    }
}
