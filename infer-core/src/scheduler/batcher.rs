//! Time- and size-bounded batch aggregation.
//!
//! Items accumulate until the batch is full, at which point the emit
//! callback runs synchronously in the caller. A partial batch that has
//! been waiting since its first item for the configured timeout is
//! emitted by a timer thread instead. Emission always happens under the
//! state mutex, so the callback never observes two batches out of order
//! and never runs concurrently with itself.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type EmitFn<T> = Box<dyn Fn(Vec<T>) + Send + Sync>;

struct BatchState<T> {
    items: Vec<T>,
    // Deadline for the in-progress batch; cleared by any emission, which
    // is what cancels the pending timer wake.
    deadline: Option<Instant>,
    stopped: bool,
}

struct BatcherShared<T> {
    state: Mutex<BatchState<T>>,
    wake: Condvar,
    emit: EmitFn<T>,
    batch_size: usize,
    timeout: Duration,
}

impl<T> BatcherShared<T> {
    fn flush(&self, state: &mut BatchState<T>) {
        state.deadline = None;
        if state.items.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.items);
        (self.emit)(batch);
    }
}

/// Aggregates items of type `T` into fixed-size batches under a timeout.
pub struct Batcher<T: Send + 'static> {
    shared: Arc<BatcherShared<T>>,
    timer: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new<F>(emit: F, timeout: Duration, batch_size: usize) -> Self
    where
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        let shared = Arc::new(BatcherShared {
            state: Mutex::new(BatchState {
                items: Vec::with_capacity(batch_size),
                deadline: None,
                stopped: false,
            }),
            wake: Condvar::new(),
            emit: Box::new(emit),
            batch_size: batch_size.max(1),
            timeout,
        });
        let timer_shared = Arc::clone(&shared);
        let timer = thread::Builder::new()
            .name("infer-batcher".to_string())
            .spawn(move || timer_loop(timer_shared))
            .ok();
        if timer.is_none() {
            tracing::error!("failed to spawn batcher timer thread, timeout emission disabled");
        }
        Self { shared, timer }
    }

    /// Add one item. Emits synchronously when the batch fills up.
    pub fn add_item(&self, item: T) {
        let mut state = self.shared.state.lock().unwrap();
        state.items.push(item);
        if state.items.len() >= self.shared.batch_size {
            self.shared.flush(&mut state);
        } else if state.items.len() == 1 {
            state.deadline = Some(Instant::now() + self.shared.timeout);
            self.shared.wake.notify_one();
        }
    }

    /// Force emission of the current partial batch.
    pub fn emit_now(&self) {
        let mut state = self.shared.state.lock().unwrap();
        self.shared.flush(&mut state);
    }

    /// Number of items waiting in the current partial batch.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Drop for Batcher<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.items.is_empty() {
                tracing::warn!(
                    pending = state.items.len(),
                    "batcher dropped with unemitted items"
                );
            }
            state.stopped = true;
        }
        self.shared.wake.notify_all();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

fn timer_loop<T>(shared: Arc<BatcherShared<T>>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.stopped {
            return;
        }
        match state.deadline {
            None => {
                state = shared.wake.wait(state).unwrap();
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    shared.flush(&mut state);
                } else {
                    let (guard, _) = shared.wake.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_batcher(
        timeout: Duration,
        batch_size: usize,
    ) -> (Batcher<u32>, Arc<Mutex<Vec<Vec<u32>>>>) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let batcher = Batcher::new(
            move |batch| sink.lock().unwrap().push(batch),
            timeout,
            batch_size,
        );
        (batcher, emitted)
    }

    #[test]
    fn emits_synchronously_when_full() {
        let (batcher, emitted) = collecting_batcher(Duration::from_secs(10), 3);
        batcher.add_item(1);
        batcher.add_item(2);
        assert!(emitted.lock().unwrap().is_empty());
        batcher.add_item(3);
        // Size-triggered emission happens inside add_item.
        assert_eq!(*emitted.lock().unwrap(), vec![vec![1, 2, 3]]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn emits_partial_batch_on_timeout() {
        let (batcher, emitted) = collecting_batcher(Duration::from_millis(40), 8);
        batcher.add_item(7);
        batcher.add_item(8);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(*emitted.lock().unwrap(), vec![vec![7, 8]]);
    }

    #[test]
    fn size_trigger_cancels_pending_timer() {
        let (batcher, emitted) = collecting_batcher(Duration::from_millis(50), 2);
        batcher.add_item(1);
        batcher.add_item(2); // fills the batch, cancels the timer
        thread::sleep(Duration::from_millis(120));
        // Only the size-triggered emission, no empty timeout emission.
        assert_eq!(*emitted.lock().unwrap(), vec![vec![1, 2]]);
    }

    #[test]
    fn emit_now_flushes_partial_batch() {
        let (batcher, emitted) = collecting_batcher(Duration::from_secs(10), 8);
        batcher.add_item(5);
        batcher.emit_now();
        assert_eq!(*emitted.lock().unwrap(), vec![vec![5]]);
        // Flushing an empty accumulator emits nothing.
        batcher.emit_now();
        assert_eq!(emitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn batches_preserve_arrival_order() {
        let (batcher, emitted) = collecting_batcher(Duration::from_secs(10), 2);
        for i in 0..6 {
            batcher.add_item(i);
        }
        let batches = emitted.lock().unwrap();
        assert_eq!(*batches, vec![vec![0, 1], vec![2, 3], vec![4, 5]]);
    }

    #[test]
    fn timer_restarts_for_each_new_batch() {
        let (batcher, emitted) = collecting_batcher(Duration::from_millis(40), 8);
        batcher.add_item(1);
        thread::sleep(Duration::from_millis(120));
        batcher.add_item(2);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(*emitted.lock().unwrap(), vec![vec![1], vec![2]]);
    }
}
