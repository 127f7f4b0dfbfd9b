//! Priority-ordered worker pool driving every pipeline stage.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::error::InferError;

/// Closure run once in each new worker before it starts pulling tasks;
/// used to bind the worker thread to the accelerator device.
pub type ThreadInitFn = Arc<dyn Fn() -> bool + Send + Sync>;

struct Task {
    priority: i64,
    seq: u64,
    func: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    // max-heap: highest key first, FIFO within equal keys
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolCore {
    queue: Mutex<BinaryHeap<Task>>,
    cond: Condvar,
    n_waiting: AtomicU32,
    // finish once the queue drains
    is_done: AtomicBool,
    // finish immediately, queue cleared
    is_stop: AtomicBool,
    seq: AtomicU64,
    init_fn: Option<ThreadInitFn>,
}

struct Worker {
    exit: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Completion handle of a task submitted with
/// [`PriorityThreadPool::push`].
pub struct TaskFuture<R> {
    rx: Receiver<R>,
}

impl<R> TaskFuture<R> {
    /// Block until the task completes. A task that panicked or was
    /// cleared on shutdown yields `Unavailable`.
    pub fn wait(&self) -> Result<R, InferError> {
        self.rx
            .recv()
            .map_err(|_| InferError::Unavailable("task dropped before completion".into()))
    }

    /// Block up to `timeout` for the task to complete.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, InferError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => InferError::Timeout("task wait expired".into()),
            RecvTimeoutError::Disconnected => {
                InferError::Unavailable("task dropped before completion".into())
            }
        })
    }
}

/// Worker pool extracting the pending task with the largest priority
/// key first.
///
/// Two submit modes: [`push`](Self::push) hands back a [`TaskFuture`]
/// that also surfaces task loss, [`void_push`](Self::void_push) is
/// fire-and-forget for closures that must not fail.
pub struct PriorityThreadPool {
    core: Arc<PoolCore>,
    workers: Mutex<Vec<Worker>>,
}

impl PriorityThreadPool {
    /// Pool with `n_threads` workers; `init_fn` runs once per worker.
    pub fn new(init_fn: Option<ThreadInitFn>, n_threads: usize) -> Self {
        let pool = Self {
            core: Arc::new(PoolCore {
                queue: Mutex::new(BinaryHeap::new()),
                cond: Condvar::new(),
                n_waiting: AtomicU32::new(0),
                is_done: AtomicBool::new(false),
                is_stop: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                init_fn,
            }),
            workers: Mutex::new(Vec::new()),
        };
        if n_threads > 0 {
            pool.resize(n_threads);
        }
        pool
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Number of workers currently blocked waiting for a task.
    pub fn idle_count(&self) -> u32 {
        self.core.n_waiting.load(Ordering::Acquire)
    }

    /// Grow or shrink the worker set. Excess workers are flagged and
    /// detached; each exits once its current task returns.
    pub fn resize(&self, n_threads: usize) {
        if self.core.is_stop.load(Ordering::Acquire) || self.core.is_done.load(Ordering::Acquire) {
            return;
        }
        let mut workers = self.workers.lock();
        let old = workers.len();
        if old <= n_threads {
            debug!("thread pool: add {} workers", n_threads - old);
            for _ in old..n_threads {
                let exit = Arc::new(AtomicBool::new(false));
                let core = Arc::clone(&self.core);
                let flag = Arc::clone(&exit);
                let handle = thread::Builder::new()
                    .name("infer-worker".into())
                    .spawn(move || worker_loop(core, flag))
                    .expect("spawn worker thread");
                workers.push(Worker { exit, handle });
            }
        } else {
            debug!("thread pool: stop {} workers, {} remain", old - n_threads, n_threads);
            for worker in workers.drain(n_threads..) {
                worker.exit.store(true, Ordering::Release);
                // detached; exits after its current task
                drop(worker.handle);
            }
            self.core.cond.notify_all();
        }
    }

    /// Submit a task; the returned future yields the closure's result.
    pub fn push<F, R>(&self, priority: i64, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.void_push(priority, move || {
            let _ = tx.send(f());
        });
        TaskFuture { rx }
    }

    /// Submit a fire-and-forget task. The closure must not panic.
    pub fn void_push<F>(&self, priority: i64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        trace!(
            "submit task, priority {priority}, pool (idle/total): {}/{}",
            self.idle_count(),
            self.size()
        );
        let task = Task {
            priority,
            seq: self.core.seq.fetch_add(1, Ordering::Relaxed),
            func: Box::new(f),
        };
        self.core.queue.lock().push(task);
        self.core.cond.notify_one();
    }

    /// Drop every pending task without running it.
    pub fn clear_queue(&self) {
        self.core.queue.lock().clear();
    }

    /// Stop all workers. With `wait_all_task_done` the queue drains
    /// first; otherwise it is cleared and workers exit as soon as their
    /// current task returns.
    pub fn stop(&self, wait_all_task_done: bool) {
        if wait_all_task_done {
            if self.core.is_done.swap(true, Ordering::AcqRel)
                || self.core.is_stop.load(Ordering::Acquire)
            {
                return;
            }
            debug!("thread pool: draining tasks before stop");
        } else {
            if self.core.is_stop.swap(true, Ordering::AcqRel) {
                return;
            }
            debug!("thread pool: stopping without draining");
            let mut workers = self.workers.lock();
            for w in workers.iter_mut() {
                w.exit.store(true, Ordering::Release);
            }
            drop(workers);
            self.clear_queue();
        }

        self.core.cond.notify_all();
        let workers: Vec<Worker> = std::mem::take(&mut *self.workers.lock());
        for w in workers {
            let _ = w.handle.join();
        }
        self.clear_queue();
    }
}

impl Drop for PriorityThreadPool {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn worker_loop(core: Arc<PoolCore>, exit: Arc<AtomicBool>) {
    if let Some(init) = &core.init_fn {
        if (init)() {
            trace!("worker init done");
        } else {
            error!("worker init failed, worker continues but the pipeline may misbehave");
        }
    }
    loop {
        let task = {
            let mut queue = core.queue.lock();
            loop {
                if core.is_stop.load(Ordering::Acquire) {
                    return;
                }
                if let Some(task) = queue.pop() {
                    break task;
                }
                if core.is_done.load(Ordering::Acquire) || exit.load(Ordering::Acquire) {
                    return;
                }
                core.n_waiting.fetch_add(1, Ordering::AcqRel);
                core.cond.wait(&mut queue);
                core.n_waiting.fetch_sub(1, Ordering::AcqRel);
            }
        };
        (task.func)();
        if exit.load(Ordering::Acquire) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as PlMutex;

    use super::*;

    #[test]
    fn future_returns_value() {
        let pool = PriorityThreadPool::new(None, 2);
        let fut = pool.push(0, || 21 * 2);
        assert_eq!(fut.wait().unwrap(), 42);
    }

    #[test]
    fn highest_priority_first() {
        let pool = PriorityThreadPool::new(None, 1);
        let order = Arc::new(PlMutex::new(Vec::new()));
        let (gate_tx, gate_rx) = bounded::<()>(0);

        // occupy the single worker so submissions below queue up
        pool.void_push(100, move || {
            let _ = gate_rx.recv();
        });
        for p in [3i64, 1, 9, 7] {
            let order = Arc::clone(&order);
            pool.void_push(p, move || order.lock().push(p));
        }
        gate_tx.send(()).unwrap();
        pool.stop(true);
        assert_eq!(*order.lock(), vec![9, 7, 3, 1]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let pool = PriorityThreadPool::new(None, 1);
        let order = Arc::new(PlMutex::new(Vec::new()));
        let (gate_tx, gate_rx) = bounded::<()>(0);
        pool.void_push(1, move || {
            let _ = gate_rx.recv();
        });
        for i in 0..5 {
            let order = Arc::clone(&order);
            pool.void_push(0, move || order.lock().push(i));
        }
        gate_tx.send(()).unwrap();
        pool.stop(true);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn init_fn_runs_per_worker() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let pool = PriorityThreadPool::new(
            Some(Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                true
            })),
            3,
        );
        pool.stop(true);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn resize_up_and_down() {
        let pool = PriorityThreadPool::new(None, 1);
        assert_eq!(pool.size(), 1);
        pool.resize(4);
        assert_eq!(pool.size(), 4);
        pool.resize(2);
        assert_eq!(pool.size(), 2);
        // detached workers still drain tasks already queued
        let fut = pool.push(0, || 1);
        assert_eq!(fut.wait().unwrap(), 1);
    }

    #[test]
    fn stop_without_drain_clears_queue() {
        // no workers: the task stays queued until stop clears it
        let pool = PriorityThreadPool::new(None, 0);
        let fut = pool.push(0, || 5);
        pool.stop(false);
        assert!(matches!(fut.wait(), Err(InferError::Unavailable(_))));
    }
}
