//! Shared processors and helpers for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use infer_core::{InferData, Model, Package, Processor, Status, UserData};

/// Pass-through stage.
pub struct Identity {
    pub name: &'static str,
}

impl Processor for Identity {
    fn process(&mut self, _pkg: &mut Package) -> Status {
        Status::Success
    }
    fn type_name(&self) -> &str {
        self.name
    }
    fn fork(&self) -> Box<dyn Processor> {
        Box::new(Identity { name: self.name })
    }
}

/// Doubles every `u32` payload in place.
pub struct Doubler;

impl Processor for Doubler {
    fn process(&mut self, pkg: &mut Package) -> Status {
        for unit in pkg.data.iter_mut() {
            if let Some(value) = unit.get_ref::<u32>().copied() {
                unit.set(value * 2);
            }
        }
        Status::Success
    }
    fn type_name(&self) -> &str {
        "Doubler"
    }
    fn fork(&self) -> Box<dyn Processor> {
        Box::new(Doubler)
    }
}

/// Expands a continuous package into `data_num` indexed units, the way
/// an inference stage expands a batched input.
pub struct Expander;

impl Processor for Expander {
    fn process(&mut self, pkg: &mut Package) -> Status {
        if pkg.data.len() == 1 && pkg.data_num > 1 {
            let base = pkg.data[0].get_ref::<u32>().copied().unwrap_or(0);
            pkg.data = (0..pkg.data_num as u32)
                .map(|i| InferData::new(base + i))
                .collect();
        }
        Status::Success
    }
    fn type_name(&self) -> &str {
        "Expander"
    }
    fn fork(&self) -> Box<dyn Processor> {
        Box::new(Expander)
    }
}

/// Sleeps for a fixed time in every invocation.
pub struct Sleeper {
    pub name: &'static str,
    pub delay: Duration,
}

impl Processor for Sleeper {
    fn process(&mut self, _pkg: &mut Package) -> Status {
        std::thread::sleep(self.delay);
        Status::Success
    }
    fn type_name(&self) -> &str {
        self.name
    }
    fn fork(&self) -> Box<dyn Processor> {
        Box::new(Sleeper {
            name: self.name,
            delay: self.delay,
        })
    }
}

/// Always returns the configured status.
pub struct Failing {
    pub status: Status,
}

impl Processor for Failing {
    fn process(&mut self, _pkg: &mut Package) -> Status {
        self.status
    }
    fn type_name(&self) -> &str {
        "Failing"
    }
    fn fork(&self) -> Box<dyn Processor> {
        Box::new(Failing {
            status: self.status,
        })
    }
}

/// Observer that records every notify.
pub struct Collector {
    pub log: Mutex<Vec<(Status, Option<u32>)>>,
    pub calls: AtomicUsize,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.calls.load(Ordering::SeqCst) >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.calls.load(Ordering::SeqCst) >= count
    }
}

impl infer_core::Observer for Collector {
    fn notify(&self, status: Status, output: InferData, _user_data: &UserData) {
        self.log
            .lock()
            .unwrap()
            .push((status, output.get_ref::<u32>().copied()));
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// A model handle with a unique path so each test gets its own
/// executor fingerprint.
pub fn unique_model(tag: &str) -> Arc<Model> {
    Arc::new(Model::new(format!("/models/{tag}.model"), "subnet0", 4))
}

/// Package of consecutive `u32` payloads starting at `start`.
pub fn numbered_package(start: u32, count: u32) -> Package {
    Package::from_data((start..start + count).map(InferData::new))
}
