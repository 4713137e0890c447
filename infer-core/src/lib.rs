//! infer-core - pipelined inference serving runtime
//!
//! Turns user requests into pipelined invocations of a fixed chain of
//! processors (preprocess → inference → postprocess) on a shared,
//! priority-scheduled worker pool.
//!
//! # Architecture
//!
//! - **Scheduler**: a strict-priority thread pool shared by every executor
//!   on a device, a time/size-bounded batcher, and a bounded package cache
//!   with dynamic and static batching strategies.
//! - **Pipeline**: one task node per processor stage; packages move from
//!   node to node through the pool with refined priorities so in-flight
//!   work is never starved by new arrivals.
//! - **Lifecycle**: sessions multiplex onto executors keyed by a
//!   configuration fingerprint; executors are reference counted by their
//!   linked sessions and torn down when the last one unlinks.
//!
//! # Entry points
//!
//! [`InferServer`] is the process-level directory: create it per device,
//! create sessions from a [`SessionDescriptor`], then submit work with
//! [`InferServer::request`] (asynchronous, observer-driven) or
//! [`InferServer::request_sync`] (blocking with a timeout).

pub mod config;
pub mod engine;
pub mod executor;
pub mod models;
pub mod request;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod telemetry;

use std::fmt;

pub use engine::Processor;
pub use executor::Executor;
pub use models::{Model, ModelError, ModelManager};
pub use request::{InferData, Package, RequestControl, UserData};
pub use scheduler::{BatchStrategy, Batcher, PoolError, Priority, PriorityThreadPool};
pub use server::InferServer;
pub use session::{Observer, Session, SessionDescriptor};

/// Wire-visible completion status of a request or a pipeline stage.
///
/// A discarded request completes with [`Status::Success`]: it finished
/// without producing output, which is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Completed, or intentionally dropped without output.
    Success,
    /// The caller handed over an unusable argument.
    InvalidParam,
    /// Sync/async API used against the opposite session kind.
    WrongType,
    /// A processor or the dispatch machinery failed.
    ErrorBackend,
    /// The request did not complete within the caller's budget.
    Timeout,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::InvalidParam => "INVALID_PARAM",
            Self::WrongType => "WRONG_TYPE",
            Self::ErrorBackend => "ERROR_BACKEND",
            Self::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_wire_names() {
        assert_eq!(Status::Success.to_string(), "SUCCESS");
        assert_eq!(Status::InvalidParam.to_string(), "INVALID_PARAM");
        assert_eq!(Status::WrongType.to_string(), "WRONG_TYPE");
        assert_eq!(Status::ErrorBackend.to_string(), "ERROR_BACKEND");
        assert_eq!(Status::Timeout.to_string(), "TIMEOUT");
    }

    #[test]
    fn only_success_is_success() {
        assert!(Status::Success.is_success());
        assert!(!Status::Timeout.is_success());
        assert!(!Status::ErrorBackend.is_success());
    }
}
