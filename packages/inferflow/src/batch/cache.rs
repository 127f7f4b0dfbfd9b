//! Batch queues between request admission and engine dispatch.
//!
//! Two strategies: the dynamic cache batches items across requests, the
//! static cache preserves caller-supplied grouping. Both drop discarded
//! items on the way out while keeping their fan-in counts intact.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::batch::batcher::Batcher;
use crate::domain::{InferData, Package};
use crate::pool::Priority;

/// Batch source feeding an executor's dispatch loop.
pub(crate) trait Cache: Send + Sync {
    fn start(&self);

    /// Refuse further pushes and wake blocked poppers once drained.
    fn stop(&self);

    fn running(&self) -> bool;

    /// Hand a request package to the batching layer. Fails with the
    /// package returned when the cache is stopped.
    fn push(&self, pack: Package) -> Result<(), Package>;

    /// Take the next ready batch. Blocks until one is available; returns
    /// `None` once stopped and drained, or when a discard sweep consumed
    /// the front, in which case the caller just re-enters.
    fn pop(&self) -> Option<Package>;
}

struct CacheCore {
    queue: Mutex<VecDeque<Package>>,
    cond: Condvar,
    running: AtomicBool,
    batch_size: usize,
    priority: Priority,
}

impl CacheCore {
    fn new(batch_size: usize, priority: Priority) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(false),
            batch_size,
            priority,
        }
    }

    fn push_ready(&self, pack: Package) {
        self.queue.lock().push_back(pack);
        self.cond.notify_all();
    }

    fn pop_with(&self, clear_discard: impl FnOnce(&mut VecDeque<Package>)) -> Option<Package> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.cond
                .wait_while(&mut queue, |q| q.is_empty() && self.running.load(Ordering::Acquire));
            if queue.is_empty() {
                return None;
            }
        }
        let front_has_discard = queue.front().is_some_and(|pack| {
            pack.data
                .iter()
                .any(|item| item.ctrl.as_ref().is_some_and(|c| c.is_discarded()))
        });
        if front_has_discard {
            debug!("clear discarded cached data");
            clear_discard(&mut queue);
            if queue.is_empty() {
                return None;
            }
        }
        let pack = queue.pop_front();
        drop(queue);
        self.cond.notify_one();
        pack
    }
}

fn priority_for(priority: &Priority, items: &[InferData]) -> i64 {
    let earliest = items
        .first()
        .and_then(|item| item.ctrl.as_ref())
        .map_or(0, |c| c.request_id());
    priority.get(-earliest)
}

/// Cross-request batching: items from different requests are merged into
/// model-batch-sized packages by a [`Batcher`].
pub(crate) struct DynamicCache {
    core: Arc<CacheCore>,
    batcher: Arc<Batcher<InferData>>,
}

impl DynamicCache {
    pub(crate) fn new(batch_size: usize, priority: Priority, batch_timeout: Option<Duration>) -> Self {
        let core = Arc::new(CacheCore::new(batch_size, priority));
        let sink = Arc::clone(&core);
        let batcher = Batcher::new(
            Box::new(move |items: Vec<InferData>| {
                let mut pack = Package::default();
                pack.priority = priority_for(&sink.priority, &items);
                pack.data = items;
                sink.push_ready(pack);
            }),
            batch_timeout,
            batch_size,
        );
        Self { core, batcher }
    }

    // rebatch: drop discarded items, regroup survivors into
    // batch-size packages and requeue them in order
    fn clear_discard(core: &CacheCore, queue: &mut VecDeque<Package>) {
        let mut survivors: Vec<InferData> = Vec::new();
        for pack in queue.drain(..) {
            for item in pack.data {
                match &item.ctrl {
                    Some(ctrl) if ctrl.is_discarded() => {
                        // keep the fan-in count intact, discards are not
                        // errors
                        ctrl.process_failed(Ok(()));
                    }
                    _ => survivors.push(item),
                }
            }
        }
        let mut items = survivors.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<InferData> = items.by_ref().take(core.batch_size).collect();
            let mut pack = Package::default();
            pack.priority = priority_for(&core.priority, &chunk);
            pack.data = chunk;
            queue.push_back(pack);
        }
    }
}

impl Cache for DynamicCache {
    fn start(&self) {
        self.core.running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.core.running.store(false, Ordering::Release);
        // flush the partial batch so pop() can drain it
        self.batcher.emit();
        self.core.cond.notify_all();
    }

    fn running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    fn push(&self, mut pack: Package) -> Result<(), Package> {
        if !self.running() {
            return Err(pack);
        }
        for item in pack.data.drain(..) {
            self.batcher.add_item(item);
        }
        Ok(())
    }

    fn pop(&self) -> Option<Package> {
        let core = Arc::clone(&self.core);
        self.core.pop_with(move |queue| Self::clear_discard(&core, queue))
    }
}

/// In-request batching: requests are split into at-most-batch-size
/// sub-packages but never mixed with one another.
pub(crate) struct StaticCache {
    core: CacheCore,
}

impl StaticCache {
    pub(crate) fn new(batch_size: usize, priority: Priority) -> Self {
        Self { core: CacheCore::new(batch_size, priority) }
    }

    // whole sub-packages are kept or dropped; grouping is never redone
    fn clear_discard(queue: &mut VecDeque<Package>) {
        let kept: VecDeque<Package> = queue
            .drain(..)
            .filter_map(|pack| {
                let discarded = pack.data.first().is_some_and(|item| {
                    item.ctrl.as_ref().is_some_and(|c| c.is_discarded())
                });
                if discarded {
                    for item in pack.data {
                        if let Some(ctrl) = &item.ctrl {
                            ctrl.process_failed(Ok(()));
                        }
                    }
                    None
                } else {
                    Some(pack)
                }
            })
            .collect();
        *queue = kept;
    }
}

impl Cache for StaticCache {
    fn start(&self) {
        self.core.running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.core.running.store(false, Ordering::Release);
        self.core.cond.notify_all();
    }

    fn running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    fn push(&self, mut pack: Package) -> Result<(), Package> {
        if !self.running() {
            return Err(pack);
        }
        // prefilled prediction IO skips preprocess and must stay whole
        if pack.predict_io.is_some() {
            pack.priority = priority_for(&self.core.priority, &pack.data);
            self.core.push_ready(pack);
            return Ok(());
        }
        let tag = pack.tag.clone();
        let mut items = pack.data.drain(..).peekable();
        while items.peek().is_some() {
            let chunk: Vec<InferData> = items.by_ref().take(self.core.batch_size).collect();
            let mut sub = Package::new(tag.clone());
            sub.priority = priority_for(&self.core.priority, &chunk);
            sub.data = chunk;
            self.core.push_ready(sub);
        }
        Ok(())
    }

    fn pop(&self) -> Option<Package> {
        self.core.pop_with(Self::clear_discard)
    }
}
