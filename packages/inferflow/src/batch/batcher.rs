//! Size- and timeout-driven item accumulator feeding the dynamic cache.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard};

use crate::pool::Timer;

type NotifierFn<T> = Box<dyn Fn(Vec<T>) + Send + Sync>;

struct BatchState<T> {
    items: Vec<T>,
    // true until the first item of a fresh accumulation arrives
    first: bool,
}

/// Accumulates items until `batch_size` is reached or `timeout` passes
/// since the first item, then hands the batch to the notifier.
pub(crate) struct Batcher<T> {
    state: Mutex<BatchState<T>>,
    notifier: NotifierFn<T>,
    timeout: Option<Duration>,
    batch_size: usize,
    timer: Timer,
    // bumped on every emission; a timer armed for an older generation
    // must not fire into the refilled accumulator
    generation: AtomicU64,
}

impl<T: Send + 'static> Batcher<T> {
    pub(crate) fn new(
        notifier: NotifierFn<T>,
        timeout: Option<Duration>,
        batch_size: usize,
    ) -> Arc<Self> {
        assert!(batch_size > 0, "batch size is 0");
        debug!("batcher: timeout {timeout:?}, batch size {batch_size}");
        Arc::new(Self {
            state: Mutex::new(BatchState { items: Vec::with_capacity(batch_size), first: true }),
            notifier,
            timeout,
            batch_size,
            timer: Timer::new(),
            generation: AtomicU64::new(0),
        })
    }

    pub(crate) fn add_item(self: &Arc<Self>, item: T) {
        trace!("batcher: add one item");
        let mut state = self.state.lock();
        if let Some(timeout) = self.timeout {
            if state.first {
                let generation = self.generation.load(Ordering::Acquire);
                let weak = Arc::downgrade(self);
                self.timer.cancel();
                self.timer.notify_after(timeout, move || {
                    if let Some(batcher) = weak.upgrade() {
                        batcher.emit_generation(generation);
                    }
                });
                state.first = false;
            }
        }
        state.items.push(item);
        if state.items.len() >= self.batch_size {
            self.notify(state);
        }
    }

    /// Flush whatever has accumulated, if anything.
    pub(crate) fn emit(&self) {
        self.notify(self.state.lock());
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    // timeout path: only flush if nothing was emitted since arming
    fn emit_generation(&self, generation: u64) {
        let state = self.state.lock();
        if self.generation.load(Ordering::Acquire) == generation {
            self.notify(state);
        }
    }

    fn notify(&self, mut state: MutexGuard<'_, BatchState<T>>) {
        if state.items.is_empty() {
            return;
        }
        let batch = mem::replace(&mut state.items, Vec::with_capacity(self.batch_size));
        state.first = true;
        self.generation.fetch_add(1, Ordering::AcqRel);
        drop(state);
        trace!("batcher: emit a batch of {}", batch.len());
        (self.notifier)(batch);
    }
}
