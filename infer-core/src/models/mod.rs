//! Model handles and the process-global model cache.

mod manager;

pub use manager::{Model, ModelError, ModelManager};
