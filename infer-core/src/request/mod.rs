//! Request-side data model: the units and packages travelling through
//! the pipeline, and the per-request completion aggregator.

mod control;
mod package;

pub use control::RequestControl;
pub(crate) use control::CompletionFn;
pub use package::{InferData, Package, UserData};
pub(crate) use package::TaskDesc;
