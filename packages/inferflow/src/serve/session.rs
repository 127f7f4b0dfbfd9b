//! Per-client session: request admission and strictly ordered
//! response delivery.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::batch::BatchStrategy;
use crate::domain::{DataLayout, DataType, DimOrder, Package};
use crate::error::{InferError, Status};
use crate::perf::{LatencyRecorder, LatencyStatistic, Profiler, ThroughputStatistic};
use crate::pipeline::model::Model;
use crate::pipeline::processor::Processor;
use crate::pool::{Priority, Timer};
use crate::serve::executor::Executor;
use crate::serve::request::{RequestControl, ResponseFn};

/// Opaque per-request payload echoed back through the observer.
pub type UserData = Option<Box<dyn Any + Send>>;

/// Response sink of an asynchronous session.
pub trait Observer: Send + Sync {
    /// Receive one response. Responses of a session arrive in request
    /// order; a discarded request arrives with an empty data list.
    fn on_response(&self, status: Status, response: Package, user_data: UserData);
}

/// Execution graph description used to create a session.
pub struct SessionDesc {
    /// Label used in logs and diagnostics.
    pub name: String,
    /// Model to serve (required).
    pub model: Option<Arc<dyn Model>>,
    pub strategy: BatchStrategy,
    /// Layout of host-side input data handed to preprocess.
    pub host_input_layout: DataLayout,
    /// Layout of host-side output data produced by postprocess.
    pub host_output_layout: DataLayout,
    /// Preprocess stage; pass-through when absent.
    pub preproc: Option<Box<dyn Processor>>,
    /// Postprocess stage; emits tensors directly when absent.
    pub postproc: Option<Box<dyn Processor>>,
    /// Max wait before an incomplete batch is emitted (dynamic only).
    pub batch_timeout: Duration,
    /// Session base priority, effectively clamped to [0, 9].
    pub priority: i32,
    /// Number of parallel engines.
    pub engine_num: u32,
    /// Periodically log latency and throughput numbers.
    pub show_perf: bool,
}

impl Default for SessionDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            model: None,
            strategy: BatchStrategy::Dynamic,
            host_input_layout: DataLayout::new(DataType::U8, DimOrder::NHWC),
            host_output_layout: DataLayout::new(DataType::F32, DimOrder::NHWC),
            preproc: None,
            postproc: None,
            batch_timeout: Duration::from_millis(100),
            priority: 0,
            engine_num: 1,
            show_perf: true,
        }
    }
}

struct SessionState {
    request_list: VecDeque<Arc<RequestControl>>,
    request_id: i64,
}

/// Per-client handle over a shared executor.
///
/// Guarantees responses in strict request-id order, at most one
/// response task at a time, and drains fully before shutdown returns.
pub struct Session {
    name: String,
    executor: Arc<Executor>,
    observer: Option<Arc<dyn Observer>>,
    state: Mutex<SessionState>,
    sync_cond: Condvar,
    running: AtomicBool,
    in_response: AtomicBool,
    recorder: LatencyRecorder,
    profiler: Profiler,
    perf_timer: Timer,
}

impl Session {
    pub(crate) fn new(
        name: String,
        executor: Arc<Executor>,
        observer: Option<Arc<dyn Observer>>,
        show_perf: bool,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            name,
            executor,
            observer,
            state: Mutex::new(SessionState { request_list: VecDeque::new(), request_id: 0 }),
            sync_cond: Condvar::new(),
            running: AtomicBool::new(true),
            in_response: AtomicBool::new(false),
            recorder: LatencyRecorder::default(),
            profiler: Profiler::default(),
            perf_timer: Timer::new(),
        });
        if show_perf {
            let weak = Arc::downgrade(&session);
            session.perf_timer.notify_every(Duration::from_secs(2), move || {
                if let Some(session) = weak.upgrade() {
                    session.profiler.update();
                    let tp = session.profiler.summary();
                    debug!(
                        "[{}] session rps {:.1} ({:.1} rt) | ups {:.1} ({:.1} rt)",
                        session.name, tp.rps, tp.rps_rt, tp.ups, tp.ups_rt
                    );
                    session.recorder.log_performance(&session.name);
                }
            });
        }
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sessions without an observer serve the synchronous API.
    pub fn is_sync(&self) -> bool {
        self.observer.is_none()
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// True when both sessions are served by the same executor, i.e.
    /// they were created over the same (model, preprocess, postprocess)
    /// configuration.
    pub fn shares_executor_with(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.executor, &other.executor)
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn Observer>> {
        self.observer.clone()
    }

    pub(crate) fn latency(&self) -> std::collections::HashMap<String, LatencyStatistic> {
        self.recorder.performance()
    }

    pub(crate) fn throughput(&self) -> ThroughputStatistic {
        self.profiler.summary()
    }

    /// Admit one request. Links every item to a fresh request control,
    /// appends it to the ordering deque, and hands the package to the
    /// executor's cache (or responds immediately for an empty package).
    pub(crate) fn send(
        self: &Arc<Self>,
        mut pack: Package,
        response: ResponseFn,
    ) -> Result<Arc<RequestControl>, InferError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(InferError::Unavailable(format!("session not running: {}", self.name)));
        }
        if pack.predict_io.is_some() {
            if self.executor.strategy() != BatchStrategy::Static {
                return Err(InferError::InvalidParam(
                    "prefilled prediction IO requires the static batch strategy".into(),
                ));
            }
            if pack.len() > self.executor.model().info().batch_size as usize {
                return Err(InferError::InvalidParam(
                    "prefilled prediction IO is limited to one model batch".into(),
                ));
            }
        }

        let data_num = pack.len() as u32;
        let ctrl = {
            let mut state = self.state.lock();
            let weak = Arc::downgrade(self);
            let ctrl = RequestControl::new(
                response,
                Box::new(move |ctrl| {
                    if let Some(session) = weak.upgrade() {
                        session.check_and_response(ctrl);
                    }
                }),
                pack.tag.clone(),
                state.request_id,
                data_num,
            );
            state.request_id += 1;
            for (index, item) in pack.data.iter_mut().enumerate() {
                item.ctrl = Some(Arc::clone(&ctrl));
                item.index = index as u32;
            }
            state.request_list.push_back(Arc::clone(&ctrl));
            ctrl
        };

        if data_num > 0 {
            if let Err(mut pack) = self.executor.upload(pack) {
                warn!("[{}] cache stopped, request rejected", self.name);
                for item in pack.data.drain(..) {
                    if let Some(ctrl) = item.ctrl {
                        ctrl.process_failed(Err(InferError::Unavailable(
                            "batch cache is not running".into(),
                        )));
                    }
                }
            }
        } else {
            debug!("[{}] no data in package with tag [{}]", self.name, pack.tag);
            self.check_and_response(&ctrl);
        }
        Ok(ctrl)
    }

    /// Try to start response delivery. Responses leave in request order:
    /// only the front of the deque may respond, and only one response
    /// task runs per session.
    pub(crate) fn check_and_response(self: &Arc<Self>, caller: &Arc<RequestControl>) {
        let ctrl = {
            let mut state = self.state.lock();
            let Some(front) = state.request_list.front() else {
                // unblocks a shutdown waiting for drain
                self.sync_cond.notify_one();
                return;
            };
            if !Arc::ptr_eq(front, caller) && !front.is_process_finished() {
                return;
            }
            if self
                .in_response
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            state.request_list.pop_front().expect("front checked above")
        };
        // response assembly must not be starved by new inference batches
        let priority = Priority::offset_key(self.executor.priority().get(-ctrl.request_id()), 5);
        let session = Arc::clone(self);
        self.executor
            .thread_pool()
            .void_push(priority, move || session.response_task(ctrl));
    }

    // delivers responses until the front of the deque is unfinished
    fn response_task(&self, first: Arc<RequestControl>) {
        let mut next = Some(first);
        while let Some(ctrl) = next.take() {
            self.profiler.request_end(ctrl.data_num());
            if !ctrl.is_discarded() {
                for (stage, ms) in ctrl.stage_perf() {
                    self.recorder.record(stage, ctrl.data_num(), ms);
                }
                self.recorder.record("RequestLatency", 1, ctrl.latency_ms());
            }
            ctrl.respond();
            drop(ctrl);

            let mut state = self.state.lock();
            match state.request_list.front() {
                None => {
                    self.in_response.store(false, Ordering::Release);
                    self.sync_cond.notify_one();
                    return;
                }
                Some(front) if front.is_process_finished() => {
                    next = state.request_list.pop_front();
                }
                Some(_) => {
                    // cleared under the lock so a request finishing right
                    // now sees it and takes over
                    self.in_response.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }

    /// Block until the last queued request bearing `tag` has responded.
    pub(crate) fn wait_task_done(&self, tag: &str) {
        debug!("[{}] wait [{tag}] task done", self.name);
        let flag = {
            let state = self.state.lock();
            state
                .request_list
                .iter()
                .rev()
                .find(|ctrl| ctrl.tag() == tag)
                .map(|ctrl| ctrl.response_done_flag())
        };
        if let Some(flag) = flag {
            flag.wait();
        }
    }

    /// Mark every queued request bearing `tag` as discarded. Running
    /// stages are not aborted; outputs and batching are suppressed.
    pub(crate) fn discard_task(&self, tag: &str) {
        let state = self.state.lock();
        for ctrl in state.request_list.iter() {
            if ctrl.tag() == tag {
                ctrl.discard();
            }
        }
    }

    /// Stop admission and block until every outstanding request has
    /// responded.
    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let mut state = self.state.lock();
        while !state.request_list.is_empty() || self.in_response.load(Ordering::Acquire) {
            debug!("session {} waits for outstanding work in shutdown", self.name);
            self.sync_cond.wait(&mut state);
        }
        drop(state);
        self.perf_timer.cancel();
        self.recorder.log_performance(&self.name);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("sync", &self.is_sync())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
