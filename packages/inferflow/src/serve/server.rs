//! Top-level server: one device, one worker pool, deduplicated
//! executors, and the model cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::domain::{Device, Package};
use crate::error::{InferError, Status};
use crate::perf::{LatencyStatistic, ThroughputStatistic};
use crate::pipeline::model::{Model, ModelLoader, ModelRegistry, ModelSource};
use crate::pool::{PriorityThreadPool, ThreadInitFn};
use crate::serve::executor::Executor;
use crate::serve::session::{Observer, Session, SessionDesc, UserData};

/// Inference serving entry point for one accelerator device.
///
/// Sessions with the same (model, preprocess, postprocess) triple share
/// one executor; all executors of a server share one priority worker
/// pool bound to the device.
pub struct InferServer {
    device: Device,
    pool: Arc<PriorityThreadPool>,
    pool_mutex: Mutex<()>,
    executors: Mutex<HashMap<String, Arc<Executor>>>,
    registry: ModelRegistry,
    loader: Mutex<Option<Arc<dyn ModelLoader>>>,
}

impl InferServer {
    /// Server over the host-backed device `device_id`.
    pub fn new(device_id: i32) -> Result<Self, InferError> {
        Self::with_device(Device::system(device_id)?)
    }

    /// Server over a custom device binding.
    pub fn with_device(device: Device) -> Result<Self, InferError> {
        let bind = device.clone();
        let init: ThreadInitFn = Arc::new(move || match bind.allocator().bind_thread() {
            Ok(()) => true,
            Err(e) => {
                warn!("bind worker thread to device {} failed: {e}", bind.id());
                false
            }
        });
        Ok(Self {
            device,
            pool: Arc::new(PriorityThreadPool::new(Some(init), 0)),
            pool_mutex: Mutex::new(()),
            executors: Mutex::new(HashMap::new()),
            registry: ModelRegistry::new(),
            loader: Mutex::new(None),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /* --------------------- model API ----------------------------- */

    /// Register the loader used by [`InferServer::load_model`].
    pub fn set_model_loader(&self, loader: Arc<dyn ModelLoader>) {
        *self.loader.lock() = Some(loader);
    }

    /// Load a model from a path or byte slice, deduplicated by the
    /// server's model cache.
    pub fn load_model(&self, source: ModelSource<'_>) -> Result<Arc<dyn Model>, InferError> {
        let loader = self
            .loader
            .lock()
            .clone()
            .ok_or_else(|| InferError::InvalidParam("no model loader registered".into()))?;
        self.registry.load(loader.as_ref(), source, &self.device)
    }

    /// Remove a model from the cache; it persists while sessions use it.
    pub fn unload_model(&self, model: &Arc<dyn Model>) -> bool {
        self.registry.unload(model)
    }

    pub fn clear_model_cache(&self) {
        self.registry.clear();
    }

    /* -------------------- session API ----------------------------- */

    /// Create a session. With an observer the session is asynchronous
    /// ([`InferServer::request`]); without one it serves the
    /// synchronous API ([`InferServer::request_sync`]).
    pub fn create_session(
        &self,
        desc: SessionDesc,
        observer: Option<Arc<dyn Observer>>,
    ) -> Result<Arc<Session>, InferError> {
        let model = desc
            .model
            .clone()
            .ok_or_else(|| InferError::InvalidParam("model is required".into()))?;
        let session_name = desc.name.clone();
        let show_perf = desc.show_perf;
        let fingerprint = format!(
            "{}_{}_{}",
            model.info().key,
            desc.preproc.as_ref().map_or("Preprocessor", |p| p.type_name()),
            desc.postproc.as_ref().map_or("Postprocessor", |p| p.type_name()),
        );

        let (executor, created) = {
            let mut executors = self.executors.lock();
            match executors.get(&fingerprint) {
                Some(executor) => {
                    debug!("executor already exists: {fingerprint}");
                    (Arc::clone(executor), false)
                }
                None => {
                    debug!("create executor: {fingerprint}");
                    let executor = Executor::new(
                        desc,
                        fingerprint.clone(),
                        Arc::clone(&self.pool),
                        self.device.clone(),
                    )?;
                    executors.insert(fingerprint, Arc::clone(&executor));
                    (executor, true)
                }
            }
        };
        if created {
            // grow the worker pool to fit the new engines
            let _guard = self.pool_mutex.lock();
            let threads = self.pool.size();
            let max_threads = 3 * num_cpus::get();
            if threads < max_threads {
                let wanted = threads + 3 * executor.engine_num() as usize;
                self.pool.resize(wanted.min(max_threads));
            }
        }

        let session = Session::new(session_name, Arc::clone(&executor), observer, show_perf);
        executor.link(Arc::clone(&session));
        Ok(session)
    }

    /// Tear a session down, draining its outstanding requests first.
    /// The executor is disposed once its last session unlinks.
    pub fn destroy_session(&self, session: &Arc<Session>) -> bool {
        let executor = Arc::clone(session.executor());
        let known = self
            .executors
            .lock()
            .values()
            .any(|e| Arc::ptr_eq(e, &executor));
        if !known {
            warn!("session does not belong to this server");
            return false;
        }

        session.shutdown();
        executor.unlink(session);

        if executor.session_count() == 0 {
            debug!("destroy executor: {}", executor.name());
            self.executors.lock().remove(executor.name());
            executor.shutdown();
            // shrink the pool to fit the remaining load
            let _guard = self.pool_mutex.lock();
            let spare = 3 * executor.engine_num() as usize;
            if self.pool.idle_count() as usize > spare {
                debug!("reduce worker pool after destroying executor");
                self.pool.resize(self.pool.size().saturating_sub(spare));
            }
        }
        true
    }

    /* -------------------- request API ----------------------------- */

    /// Submit a request asynchronously; the session's observer receives
    /// the response. Fails with `Timeout` when admission back-pressure
    /// does not clear within `timeout` (`None` waits endlessly).
    pub fn request(
        &self,
        session: &Arc<Session>,
        input: Package,
        user_data: UserData,
        timeout: Option<Duration>,
    ) -> Result<(), InferError> {
        if session.is_sync() {
            return Err(InferError::InvalidParam(
                "sync session cannot be used with the async api".into(),
            ));
        }
        if !input.is_empty() && !session.executor().wait_if_cache_full(timeout) {
            warn!("{}] session is busy, request timeout", session.name());
            return Err(InferError::Timeout("admission wait expired".into()));
        }
        let observer = session
            .observer()
            .ok_or_else(|| InferError::InvalidParam("session has no observer".into()))?;
        session.send(
            input,
            Box::new(move |status, response| {
                observer.on_response(status, response, user_data);
            }),
        )?;
        Ok(())
    }

    /// Submit a request and wait for its response.
    ///
    /// Returns the consolidated status together with the response
    /// package. When `timeout` expires the request is discarded and the
    /// call fails with `Timeout`; no callback runs on the caller's
    /// stack afterwards.
    pub fn request_sync(
        &self,
        session: &Arc<Session>,
        input: Package,
        timeout: Option<Duration>,
    ) -> Result<(Status, Package), InferError> {
        if !session.is_sync() {
            return Err(InferError::InvalidParam(
                "async session cannot be used with the sync api".into(),
            ));
        }
        if input.is_empty() {
            return Err(InferError::InvalidParam(
                "sync request does not support an empty package".into(),
            ));
        }

        let wait_start = Instant::now();
        if !session.executor().wait_if_cache_full(timeout) {
            warn!("{}] session is busy, request timeout", session.name());
            return Err(InferError::Timeout("admission wait expired".into()));
        }
        let remaining = match timeout {
            Some(t) => {
                let left = t.saturating_sub(wait_start.elapsed());
                if left < Duration::from_millis(1) {
                    warn!("{}] session is busy, request timeout", session.name());
                    return Err(InferError::Timeout("admission wait expired".into()));
                }
                Some(left)
            }
            None => None,
        };

        let (tx, rx) = bounded(1);
        let ctrl = session.send(
            input,
            Box::new(move |status, response| {
                let _ = tx.send((status, response));
            }),
        )?;
        match remaining {
            Some(remaining) => match rx.recv_timeout(remaining) {
                Ok(result) => Ok(result),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("process timeout, discard the request");
                    ctrl.discard();
                    Err(InferError::Timeout("response wait expired".into()))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    Err(InferError::Unavailable("response dropped".into()))
                }
            },
            None => rx
                .recv()
                .map_err(|_| InferError::Unavailable("response dropped".into())),
        }
    }

    /// Block until the last request bearing `tag` has responded.
    /// Typically used at end of stream.
    pub fn wait_task_done(&self, session: &Arc<Session>, tag: &str) {
        session.wait_task_done(tag);
    }

    /// Soft-cancel every queued request bearing `tag`: running stages
    /// complete, outputs are suppressed.
    pub fn discard_task(&self, session: &Arc<Session>, tag: &str) {
        session.discard_task(tag);
    }

    /* ---------------------- perf API ------------------------------ */

    pub fn get_latency(&self, session: &Arc<Session>) -> HashMap<String, LatencyStatistic> {
        session.latency()
    }

    pub fn get_throughput(&self, session: &Arc<Session>) -> ThroughputStatistic {
        session.throughput()
    }
}

impl Drop for InferServer {
    // sessions drain, executors stop, then the pool drains
    fn drop(&mut self) {
        let executors: Vec<Arc<Executor>> =
            self.executors.lock().drain().map(|(_, e)| e).collect();
        for executor in executors {
            for session in executor.take_links() {
                session.shutdown();
            }
            executor.shutdown();
        }
    }
}
