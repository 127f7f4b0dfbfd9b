//! Executor: owns the batch cache and the engines of one
//! (model, preprocess, postprocess) configuration, dispatches batches
//! to idle engines, and enforces admission back-pressure.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::batch::{BatchStrategy, Cache, DynamicCache, StaticCache};
use crate::domain::{Device, Package};
use crate::error::InferError;
use crate::perf::LatencyStatistic;
use crate::pipeline::engine::{Engine, EngineNotifyFn};
use crate::pipeline::model::Model;
use crate::pipeline::processor::{Processor, StageContext};
use crate::pipeline::stages::{Postprocessor, Predictor, Preprocessor};
use crate::pool::{Priority, PriorityThreadPool};
use crate::serve::session::{Session, SessionDesc};

const NO_IDLE_ENGINE: usize = usize::MAX;
// preprocess, predict, postprocess
const STAGE_COUNT: usize = 3;

struct DispatchShared {
    idle: AtomicUsize,
    mutex: Mutex<()>,
    cond: Condvar,
}

struct LimitShared {
    processing: AtomicUsize,
    mutex: Mutex<()>,
    cond: Condvar,
}

pub(crate) struct Executor {
    name: String,
    strategy: BatchStrategy,
    model: Arc<dyn Model>,
    engine_num: u32,
    pool: Arc<PriorityThreadPool>,
    cache: Box<dyn Cache>,
    engines: Vec<Arc<Engine>>,
    dispatch: Arc<DispatchShared>,
    limit: Arc<LimitShared>,
    max_processing: usize,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
    links: Mutex<Vec<Arc<Session>>>,
    batch_record: Mutex<LatencyStatistic>,
    priority: Priority,
}

impl Executor {
    pub(crate) fn new(
        mut desc: SessionDesc,
        name: String,
        pool: Arc<PriorityThreadPool>,
        device: Device,
    ) -> Result<Arc<Self>, InferError> {
        let model = desc
            .model
            .take()
            .ok_or_else(|| InferError::InvalidParam("model is required".into()))?;
        if desc.engine_num == 0 {
            return Err(InferError::InvalidParam("engine number cannot be 0".into()));
        }

        let mut ctx = StageContext::defaults(Arc::clone(&model), device);
        ctx.host_input_layout = desc.host_input_layout;
        ctx.host_output_layout = desc.host_output_layout;

        let mut preproc: Box<dyn Processor> = desc
            .preproc
            .take()
            .unwrap_or_else(|| Box::new(Preprocessor::default()));
        preproc.init(&ctx)?;
        let mut predictor: Box<dyn Processor> = Box::new(Predictor::new());
        predictor.init(&ctx)?;
        let mut postproc: Box<dyn Processor> = desc.postproc.take().unwrap_or_else(|| {
            warn!("postprocessor not set, items receive output tensors directly");
            Box::new(Postprocessor::default())
        });
        postproc.init(&ctx)?;

        let dispatch = Arc::new(DispatchShared {
            idle: AtomicUsize::new(NO_IDLE_ENGINE),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        });
        let notify: EngineNotifyFn = {
            let dispatch = Arc::clone(&dispatch);
            Arc::new(move |index| {
                let _guard = dispatch.mutex.lock();
                dispatch.idle.store(index, Ordering::Release);
                dispatch.cond.notify_one();
            })
        };

        let mut engines = Vec::with_capacity(desc.engine_num as usize);
        engines.push(Arc::new(Engine::new(
            vec![preproc, predictor, postproc],
            0,
            Arc::clone(&notify),
            Arc::clone(&pool),
        )));
        for index in 1..desc.engine_num as usize {
            let fork = engines[0].fork(index, Arc::clone(&notify))?;
            engines.push(Arc::new(fork));
        }
        dispatch.idle.store(0, Ordering::Release);

        let batch_size = model.info().batch_size as usize;
        let max_processing = 2 * desc.engine_num as usize * STAGE_COUNT * batch_size;
        let priority = Priority::new(desc.priority);
        let cache: Box<dyn Cache> = match desc.strategy {
            BatchStrategy::Dynamic => {
                let timeout = (!desc.batch_timeout.is_zero()).then_some(desc.batch_timeout);
                Box::new(DynamicCache::new(batch_size, priority, timeout))
            }
            BatchStrategy::Static => Box::new(StaticCache::new(batch_size, priority)),
        };
        cache.start();

        let executor = Arc::new(Self {
            name,
            strategy: desc.strategy,
            model,
            engine_num: desc.engine_num,
            pool,
            cache,
            engines,
            dispatch,
            limit: Arc::new(LimitShared {
                processing: AtomicUsize::new(0),
                mutex: Mutex::new(()),
                cond: Condvar::new(),
            }),
            max_processing,
            dispatch_thread: Mutex::new(None),
            links: Mutex::new(Vec::new()),
            batch_record: Mutex::new(LatencyStatistic::default()),
            priority,
        });

        let dispatcher = Arc::clone(&executor);
        let handle = thread::Builder::new()
            .name("infer-dispatch".into())
            .spawn(move || dispatcher.dispatch_loop())
            .map_err(|e| InferError::Backend(format!("spawn dispatch thread: {e}")))?;
        *executor.dispatch_thread.lock() = Some(handle);
        Ok(executor)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn strategy(&self) -> BatchStrategy {
        self.strategy
    }

    pub(crate) fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub(crate) fn engine_num(&self) -> u32 {
        self.engine_num
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn thread_pool(&self) -> &Arc<PriorityThreadPool> {
        &self.pool
    }

    pub(crate) fn link(&self, session: Arc<Session>) {
        debug!("executor {}] link session {}", self.name, session.name());
        self.links.lock().push(session);
    }

    pub(crate) fn unlink(&self, session: &Arc<Session>) {
        let mut links = self.links.lock();
        match links.iter().position(|s| Arc::ptr_eq(s, session)) {
            Some(pos) => {
                debug!("executor {}] unlink session {}", self.name, session.name());
                links.swap_remove(pos);
            }
            None => warn!("no such session in this executor"),
        }
    }

    pub(crate) fn session_count(&self) -> usize {
        self.links.lock().len()
    }

    pub(crate) fn take_links(&self) -> Vec<Arc<Session>> {
        std::mem::take(&mut *self.links.lock())
    }

    /// Block until the in-flight item count is below the limit; false
    /// when `timeout` expires first.
    pub(crate) fn wait_if_cache_full(&self, timeout: Option<Duration>) -> bool {
        if self.limit.processing.load(Ordering::Acquire) < self.max_processing {
            return true;
        }
        let mut guard = self.limit.mutex.lock();
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while self.limit.processing.load(Ordering::Acquire) >= self.max_processing {
                    if self.limit.cond.wait_until(&mut guard, deadline).timed_out() {
                        return self.limit.processing.load(Ordering::Acquire)
                            < self.max_processing;
                    }
                }
                true
            }
            None => {
                debug!("wait for cache not full");
                while self.limit.processing.load(Ordering::Acquire) >= self.max_processing {
                    self.limit.cond.wait(&mut guard);
                }
                true
            }
        }
    }

    /// Count the package against the in-flight limit and hand it to the
    /// cache. The count is given back when the request control is
    /// released.
    pub(crate) fn upload(&self, pack: Package) -> Result<(), Package> {
        let data_num = pack.len();
        self.limit.processing.fetch_add(data_num, Ordering::AcqRel);
        let limit = Arc::clone(&self.limit);
        if let Some(ctrl) = pack.data.first().and_then(|item| item.ctrl.clone()) {
            ctrl.set_response_done_callback(Box::new(move || {
                limit.processing.fetch_sub(data_num, Ordering::AcqRel);
                let _guard = limit.mutex.lock();
                limit.cond.notify_one();
            }));
        }
        self.cache.push(pack)
    }

    // feed popped batches to the least-loaded idle engine
    fn dispatch_loop(&self) {
        debug!("executor {}] dispatch loop starts", self.name);
        loop {
            let Some(pack) = self.cache.pop() else {
                if !self.cache.running() {
                    break;
                }
                continue;
            };
            self.batch_record.lock().record(1, pack.len() as f32);

            let mut waited = false;
            if self.dispatch.idle.load(Ordering::Acquire) == NO_IDLE_ENGINE {
                waited = true;
                let mut guard = self.dispatch.mutex.lock();
                while self.dispatch.idle.load(Ordering::Acquire) == NO_IDLE_ENGINE {
                    self.dispatch.cond.wait(&mut guard);
                }
            }
            let index = self.dispatch.idle.load(Ordering::Acquire);
            self.engines[index].run(pack);
            self.dispatch.idle.store(NO_IDLE_ENGINE, Ordering::Release);

            // advisory hint for the next round
            if !waited {
                for (i, engine) in self.engines.iter().enumerate() {
                    if engine.is_idle() {
                        self.dispatch.idle.store(i, Ordering::Release);
                        break;
                    }
                }
            }
        }
        debug!("executor {}] dispatch loop exits", self.name);
    }

    /// Stop the cache, drain the dispatch thread, and wait until every
    /// engine has finished its in-flight batches.
    pub(crate) fn shutdown(&self) {
        self.cache.stop();
        if let Some(handle) = self.dispatch_thread.lock().take() {
            let _ = handle.join();
        }
        let mut guard = self.dispatch.mutex.lock();
        while self.engines.iter().any(|engine| engine.in_flight() > 0) {
            let _ = self
                .dispatch
                .cond
                .wait_for(&mut guard, Duration::from_millis(50));
        }
        drop(guard);
        let record = *self.batch_record.lock();
        if record.unit_cnt > 0 {
            debug!(
                "{}] processed batches: {} | items: {} | avg items per batch: {:.2}",
                self.name,
                record.unit_cnt,
                record.total,
                record.total / record.unit_cnt as f64,
            );
        }
    }
}
