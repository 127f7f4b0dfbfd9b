//! Per-request fan-in barrier.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{error, trace};
use parking_lot::{Condvar, Mutex};

use crate::domain::{InferData, Package, PerfMap, Value};
use crate::error::Status;

/// Response sink of one request.
pub(crate) type ResponseFn = Box<dyn FnOnce(Status, Package) + Send>;
/// Fired exactly once when every item of the request has completed.
pub(crate) type NotifyFn = Box<dyn Fn(&Arc<RequestControl>) + Send + Sync>;

/// One-shot completion flag supporting any number of waiters.
pub(crate) struct DoneFlag {
    done: Mutex<bool>,
    cond: Condvar,
}

impl DoneFlag {
    fn new() -> Self {
        Self { done: Mutex::new(false), cond: Condvar::new() }
    }

    pub(crate) fn set(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        self.cond.wait_while(&mut done, |d| !*d);
    }

    /// Returns false when the wait expired before completion.
    #[allow(dead_code)]
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

// shared-done block: filled by item completions, drained by the response
struct DoneBlock {
    outputs: Vec<Value>,
    perf: PerfMap,
    status: Status,
    wait_num: u32,
}

/// Fan-in barrier of one request: counts per-item completions, keeps the
/// first error, and drives the per-request response exactly once.
pub struct RequestControl {
    tag: String,
    request_id: i64,
    data_num: u32,
    response_fn: Mutex<Option<ResponseFn>>,
    done_notifier: NotifyFn,
    response_done_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    done: Mutex<DoneBlock>,
    discarded: AtomicBool,
    process_finished: AtomicBool,
    response_done: Arc<DoneFlag>,
    start: Instant,
}

impl RequestControl {
    pub(crate) fn new(
        response: ResponseFn,
        done_notifier: NotifyFn,
        tag: impl Into<String>,
        request_id: i64,
        data_num: u32,
    ) -> Arc<Self> {
        let mut outputs = Vec::with_capacity(data_num as usize);
        outputs.resize_with(data_num as usize, Value::default);
        Arc::new(Self {
            tag: tag.into(),
            request_id,
            data_num,
            response_fn: Mutex::new(Some(response)),
            done_notifier,
            response_done_cb: Mutex::new(None),
            done: Mutex::new(DoneBlock {
                outputs,
                perf: PerfMap::new(),
                status: Ok(()),
                wait_num: data_num,
            }),
            discarded: AtomicBool::new(false),
            process_finished: AtomicBool::new(data_num == 0),
            response_done: Arc::new(DoneFlag::new()),
            start: Instant::now(),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn data_num(&self) -> u32 {
        self.data_num
    }

    pub fn is_success(&self) -> bool {
        self.done.lock().status.is_ok()
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    pub fn is_process_finished(&self) -> bool {
        self.process_finished.load(Ordering::Acquire)
    }

    /// Mark results as dropped. Idempotent; in-flight items still run to
    /// completion, but their outputs are omitted from the response.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    /// Milliseconds since admission.
    pub(crate) fn latency_ms(&self) -> f32 {
        self.start.elapsed().as_secs_f32() * 1e3
    }

    /// Per-stage latency samples gathered so far.
    pub(crate) fn stage_perf(&self) -> PerfMap {
        self.done.lock().perf.clone()
    }

    /// Hook fired when this control is released (response delivered and
    /// every reference gone); used for admission accounting.
    pub(crate) fn set_response_done_callback(&self, cb: Box<dyn FnOnce() + Send>) {
        *self.response_done_cb.lock() = Some(cb);
    }

    /// Flag set once the response has been fully delivered.
    pub(crate) fn response_done_flag(&self) -> Arc<DoneFlag> {
        Arc::clone(&self.response_done)
    }

    /// Report one item as failed. Counts toward fan-in like a success
    /// but carries no output; discards go through here with `Ok(())`.
    pub(crate) fn process_failed(self: &Arc<Self>, status: Status) {
        self.process_done(status, Value::None, 0, &PerfMap::new());
    }

    /// Report one item as done. Must be called exactly `data_num` times
    /// per request across all items.
    pub(crate) fn process_done(
        self: &Arc<Self>,
        status: Status,
        output: Value,
        index: u32,
        perf: &PerfMap,
    ) {
        let finished = {
            let mut done = self.done.lock();
            if !output.is_none() {
                if (index as usize) < done.outputs.len() {
                    done.outputs[index as usize] = output;
                } else {
                    error!(
                        "request {}: item index {index} out of range ({})",
                        self.request_id, self.data_num
                    );
                }
            }
            for (k, v) in perf {
                *done.perf.entry(k).or_insert(0.0) += v;
            }
            if status.is_err() && done.status.is_ok() {
                done.status = status;
            }
            if done.wait_num == 0 {
                error!("request {}: more completions than items", self.request_id);
                return;
            }
            done.wait_num -= 1;
            trace!("request {}: one item done, {} remain", self.request_id, done.wait_num);
            done.wait_num == 0
        };
        // the notifier re-enters the session; never call it under the
        // done lock
        if finished {
            self.process_finished.store(true, Ordering::Release);
            (self.done_notifier)(self);
        }
    }

    /// Deliver the response. Discarded requests deliver an empty data
    /// list; the consolidated status is reported either way.
    pub(crate) fn respond(&self) {
        let Some(response) = self.response_fn.lock().take() else {
            error!("request {}: response already delivered", self.request_id);
            return;
        };
        let (status, outputs, perf) = {
            let mut done = self.done.lock();
            (done.status.clone(), mem::take(&mut done.outputs), mem::take(&mut done.perf))
        };
        let mut package = Package::with_capacity(outputs.len(), self.tag.clone());
        if !self.is_discarded() {
            for (idx, value) in outputs.into_iter().enumerate() {
                if value.is_none() {
                    continue;
                }
                let mut item = InferData::new(value);
                item.index = idx as u32;
                package.data.push(item);
            }
        }
        package.perf = perf;
        package.perf.insert("RequestLatency", self.latency_ms());
        response(status, package);
        trace!("request {}: response delivered", self.request_id);
    }
}

impl Drop for RequestControl {
    fn drop(&mut self) {
        if let Some(cb) = self.response_done_cb.get_mut().take() {
            cb();
        }
        self.response_done.set();
    }
}

impl std::fmt::Debug for RequestControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestControl")
            .field("tag", &self.tag)
            .field("request_id", &self.request_id)
            .field("data_num", &self.data_num)
            .field("discarded", &self.is_discarded())
            .field("finished", &self.is_process_finished())
            .finish()
    }
}
