//! Work scheduling: dispatch ordering, the shared worker pool, request
//! batching, and the package cache feeding each executor.

mod batcher;
mod cache;
mod priority;
mod thread_pool;

pub use batcher::Batcher;
pub use cache::BatchStrategy;
pub(crate) use cache::{create_cache, PackageCache};
pub use priority::Priority;
pub use thread_pool::{Job, PoolError, PriorityThreadPool, WorkerInitHook};
