//! Dispatch ordering for pipelined work.

use std::cmp::Ordering;

/// Scheduling key for a package travelling through the pipeline.
///
/// Keys form a dense total order; the pool dispatches the smallest key
/// first. Comparison is lexicographic over three fields:
///
/// 1. `base` — the user-configured priority, smaller is more urgent;
/// 2. `depth` — the pipeline stage index, compared in reverse so work
///    deeper in the pipeline dispatches before shallower work of the
///    same base class and is never starved by new arrivals;
/// 3. `seq` — the monotonic request id, so requests at the same stage
///    dispatch in submission order.
///
/// The stage index is an explicit field rather than an offset folded
/// into the request id, so [`Priority::next`] cannot collide with an
/// adjacent request's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Priority {
    base: i16,
    depth: u32,
    seq: i64,
}

impl Priority {
    /// Key for a freshly submitted request.
    pub fn new(base: i16, request_id: u64) -> Self {
        Self {
            base,
            depth: 0,
            seq: request_id as i64,
        }
    }

    /// Refined key for the next pipeline stage.
    ///
    /// Sorts strictly ahead of every same-base package that has not
    /// progressed as far, while keeping submission order among packages
    /// at the same depth.
    #[must_use]
    pub fn next(self) -> Self {
        Self {
            depth: self.depth.saturating_add(1),
            ..self
        }
    }

    pub fn base(&self) -> i16 {
        self.base
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.base
            .cmp(&other.base)
            .then_with(|| other.depth.cmp(&self.depth))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
