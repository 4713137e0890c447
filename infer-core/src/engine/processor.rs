//! The contract processors implement to run inside a pipeline.

use crate::request::Package;
use crate::Status;

/// One stage of the processing chain.
///
/// Implementations are free to be stateful: the runtime locks each
/// instance for the duration of an invocation and never shares one
/// instance across engines, so `process` always sees exclusive access.
pub trait Processor: Send {
    /// Run this stage over the package in place.
    ///
    /// Returning a non-success status terminates the whole package; the
    /// runtime reports the status to every affected request.
    fn process(&mut self, pkg: &mut Package) -> Status;

    /// Stable name used in executor fingerprints and perf maps.
    fn type_name(&self) -> &str;

    /// Produce an independent instance for another engine replica.
    ///
    /// Forks must not share mutable state. Sharing immutable state
    /// behind thread-safe handles (model weights, lookup tables) is
    /// expected; per-request scratch (streams, sequence state) must be
    /// per-instance.
    fn fork(&self) -> Box<dyn Processor>;
}
