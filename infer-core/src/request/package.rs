//! Units, descriptions, and the package carrier.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use super::control::RequestControl;
use crate::scheduler::Priority;

/// Opaque per-request context forwarded to async observers.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Description attached to one unit: the owning control plus the unit's
/// position in the original request. One desc may be shared per index by
/// every unit of a continuous batch.
#[derive(Clone)]
pub(crate) struct TaskDesc {
    pub(crate) ctrl: Arc<RequestControl>,
    pub(crate) index: usize,
}

/// One unit of user input or output with an opaque payload.
pub struct InferData {
    payload: Option<Box<dyn Any + Send>>,
    desc: Option<TaskDesc>,
}

impl InferData {
    pub fn new<V: Any + Send>(value: V) -> Self {
        Self {
            payload: Some(Box::new(value)),
            desc: None,
        }
    }

    /// A unit carrying no payload, e.g. the placeholder for a failed
    /// index in an assembled output package.
    pub fn empty() -> Self {
        Self {
            payload: None,
            desc: None,
        }
    }

    pub fn has_value(&self) -> bool {
        self.payload.is_some()
    }

    pub fn get_ref<V: Any>(&self) -> Option<&V> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<V>())
    }

    /// Replace the payload, e.g. from a processor producing its output
    /// in place.
    pub fn set<V: Any + Send>(&mut self, value: V) {
        self.payload = Some(Box::new(value));
    }

    /// Take the payload out if it has the expected type.
    pub fn take<V: Any>(&mut self) -> Option<Box<V>> {
        if self.payload.as_ref()?.is::<V>() {
            self.payload.take().and_then(|p| p.downcast::<V>().ok())
        } else {
            None
        }
    }

    pub(crate) fn set_desc(&mut self, desc: TaskDesc) {
        self.desc = Some(desc);
    }

    pub(crate) fn desc(&self) -> Option<&TaskDesc> {
        self.desc.as_ref()
    }

    pub(crate) fn take_desc(&mut self) -> Option<TaskDesc> {
        self.desc.take()
    }

    pub(crate) fn clear_desc(&mut self) {
        self.desc = None;
    }
}

impl std::fmt::Debug for InferData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferData")
            .field("has_value", &self.has_value())
            .field("has_desc", &self.desc.is_some())
            .finish()
    }
}

/// The pipeline's unit of work: an ordered batch of units, their
/// descriptions, a scheduling priority, and an optional per-stage
/// wall-time map.
///
/// `data_num` usually equals `data.len()`. It exceeds it only for
/// continuous input, where one unit stands for `data_num` indexed
/// results sharing a single description chain.
pub struct Package {
    pub data: Vec<InferData>,
    pub(crate) descs: Vec<TaskDesc>,
    pub data_num: usize,
    pub(crate) priority: Priority,
    /// Wall time per processor type name, in milliseconds.
    pub perf: HashMap<String, f64>,
    /// User-supplied group tag for cancellation and barrier waits.
    pub tag: Option<String>,
}

impl Package {
    pub fn from_data(data: impl IntoIterator<Item = InferData>) -> Self {
        let data: Vec<InferData> = data.into_iter().collect();
        let data_num = data.len();
        Self {
            data,
            descs: Vec::new(),
            data_num,
            priority: Priority::default(),
            perf: HashMap::new(),
            tag: None,
        }
    }

    pub fn single(unit: InferData) -> Self {
        Self::from_data([unit])
    }

    /// A continuous batch: one unit standing for `data_num` results.
    pub fn continuous(unit: InferData, data_num: usize) -> Self {
        let mut pkg = Self::from_data([unit]);
        pkg.data_num = data_num.max(1);
        pkg
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("data_len", &self.data.len())
            .field("descs_len", &self.descs.len())
            .field("data_num", &self.data_num)
            .field("priority", &self.priority)
            .field("tag", &self.tag)
            .finish()
    }
}
