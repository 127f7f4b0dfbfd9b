//! Linear chain of task nodes advancing a batch through the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use log::{error, trace};
use parking_lot::Mutex;

use crate::domain::{InferData, Package, PerfMap};
use crate::error::InferError;
use crate::pipeline::processor::Processor;
use crate::pool::{Priority, PriorityThreadPool};

type DoneNotifier = Arc<dyn Fn() + Send + Sync>;

/// Called with the engine index whenever a batch leaves the engine.
pub(crate) type EngineNotifyFn = Arc<dyn Fn(usize) + Send + Sync>;

/// One stage in an engine: the processor, its exclusivity lock, and the
/// link to the downstream node.
pub(crate) struct TaskNode {
    processor: Mutex<Box<dyn Processor>>,
    type_name: &'static str,
    next: Option<Arc<TaskNode>>,
    done: DoneNotifier,
    pool: Arc<PriorityThreadPool>,
}

impl TaskNode {
    fn invoke(self: Arc<Self>, mut pack: Package) {
        let start = Instant::now();
        let status = {
            // one batch per stage at a time; the stage owns device state
            let mut processor = self.processor.lock();
            processor.process(&mut pack)
        };
        pack.perf
            .insert(self.type_name, start.elapsed().as_secs_f32() * 1e3);
        match status {
            Err(e) => {
                error!("[{}] processor execute failed: {e}", self.type_name);
                for item in pack.data.drain(..) {
                    if let Some(ctrl) = item.ctrl {
                        ctrl.process_failed(Err(e.clone()));
                    }
                }
                (self.done)();
            }
            Ok(()) => {
                trace!("[{}] transmit data", self.type_name);
                self.transmit(pack);
            }
        }
    }

    fn transmit(&self, mut pack: Package) {
        if let Some(next) = &self.next {
            // advance the major band so downstream work preempts
            // upstream work of the same request
            pack.priority = Priority::next_key(pack.priority);
            let node = Arc::clone(next);
            let priority = pack.priority;
            self.pool.void_push(priority, move || node.invoke(pack));
        } else {
            // tail: fan per-item completion back into the requests
            let items = pack.data.len().max(1) as f32;
            let perf: PerfMap = pack.perf.iter().map(|(k, v)| (*k, v / items)).collect();
            for item in pack.data.drain(..) {
                let InferData { value, ctrl, index } = item;
                if let Some(ctrl) = ctrl {
                    ctrl.process_done(Ok(()), value, index, &perf);
                }
            }
            (self.done)();
        }
    }
}

/// One linear instance of the pipeline. An executor hosts N forks of
/// the same engine; forked stages share parameters but own their device
/// state, so engines run in parallel.
pub(crate) struct Engine {
    nodes: Vec<Arc<TaskNode>>,
    task_num: Arc<AtomicU32>,
    pool: Arc<PriorityThreadPool>,
}

impl Engine {
    pub(crate) fn new(
        processors: Vec<Box<dyn Processor>>,
        index: usize,
        notify: EngineNotifyFn,
        pool: Arc<PriorityThreadPool>,
    ) -> Self {
        assert!(!processors.is_empty(), "engine needs at least one stage");
        let task_num = Arc::new(AtomicU32::new(0));
        let done: DoneNotifier = {
            let task_num = Arc::clone(&task_num);
            Arc::new(move || {
                task_num.fetch_sub(1, Ordering::AcqRel);
                notify(index);
            })
        };
        // build tail first so each node links to its downstream
        let mut nodes: Vec<Arc<TaskNode>> = Vec::with_capacity(processors.len());
        let mut next: Option<Arc<TaskNode>> = None;
        for processor in processors.into_iter().rev() {
            let type_name = processor.type_name();
            let node = Arc::new(TaskNode {
                processor: Mutex::new(processor),
                type_name,
                next: next.take(),
                done: Arc::clone(&done),
                pool: Arc::clone(&pool),
            });
            next = Some(Arc::clone(&node));
            nodes.push(node);
        }
        nodes.reverse();
        Self { nodes, task_num, pool }
    }

    /// New engine whose stages are forks of this engine's stages.
    pub(crate) fn fork(&self, index: usize, notify: EngineNotifyFn) -> Result<Engine, InferError> {
        let processors = self
            .nodes
            .iter()
            .map(|node| node.processor.lock().fork())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Engine::new(processors, index, notify, Arc::clone(&self.pool)))
    }

    /// Accept a batch: submit it to the head stage at its priority.
    pub(crate) fn run(&self, pack: Package) {
        self.task_num.fetch_add(1, Ordering::AcqRel);
        let head = Arc::clone(&self.nodes[0]);
        self.pool.void_push(pack.priority, move || head.invoke(pack));
    }

    /// An engine accepts up to one batch per stage.
    pub(crate) fn is_idle(&self) -> bool {
        (self.task_num.load(Ordering::Acquire) as usize) < self.nodes.len()
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.task_num.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::domain::Value;
    use crate::error::Status;
    use crate::pipeline::processor::StageContext;
    use crate::serve::RequestControl;

    use super::*;

    struct RecordingStage {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl Processor for RecordingStage {
        fn type_name(&self) -> &'static str {
            self.name
        }

        fn init(&mut self, _ctx: &StageContext) -> Status {
            Ok(())
        }

        fn process(&mut self, _pack: &mut Package) -> Status {
            self.log.lock().push(self.name);
            if self.fail {
                Err(InferError::Backend("stage failed".into()))
            } else {
                Ok(())
            }
        }

        fn fork(&self) -> Result<Box<dyn Processor>, InferError> {
            Ok(Box::new(RecordingStage {
                name: self.name,
                log: Arc::clone(&self.log),
                fail: self.fail,
            }))
        }
    }

    fn engine_with(
        fail_mid: bool,
    ) -> (Engine, Arc<Mutex<Vec<&'static str>>>, Arc<PriorityThreadPool>, Arc<AtomicUsize>) {
        let pool = Arc::new(PriorityThreadPool::new(None, 2));
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<Box<dyn Processor>> = vec![
            Box::new(RecordingStage { name: "pre", log: Arc::clone(&log), fail: false }),
            Box::new(RecordingStage { name: "mid", log: Arc::clone(&log), fail: fail_mid }),
            Box::new(RecordingStage { name: "post", log: Arc::clone(&log), fail: false }),
        ];
        let batches_done = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&batches_done);
        let engine = Engine::new(
            stages,
            0,
            Arc::new(move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::clone(&pool),
        );
        (engine, log, pool, batches_done)
    }

    fn request_package(n: usize) -> (Arc<RequestControl>, Package) {
        let ctrl = RequestControl::new(Box::new(|_, _| {}), Box::new(|_| {}), "t", 0, n as u32);
        let mut pack = Package::new("t");
        for i in 0..n {
            let mut item = InferData::new(Value::user(i as u32));
            item.ctrl = Some(Arc::clone(&ctrl));
            item.index = i as u32;
            pack.push(item);
        }
        pack.priority = Priority::new(0).get(0);
        (ctrl, pack)
    }

    fn wait_until(deadline_ms: u64, cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(
                start.elapsed() < Duration::from_millis(deadline_ms),
                "condition not reached in time"
            );
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn stages_run_in_order_and_fan_in() {
        let (engine, log, _pool, batches_done) = engine_with(false);
        let (ctrl, pack) = request_package(2);
        engine.run(pack);
        wait_until(2000, || ctrl.is_process_finished());
        assert_eq!(*log.lock(), vec!["pre", "mid", "post"]);
        assert!(ctrl.is_success());
        assert_eq!(batches_done.load(Ordering::SeqCst), 1);
        wait_until(2000, || engine.in_flight() == 0);
        assert!(engine.is_idle());
    }

    #[test]
    fn stage_failure_fails_all_items() {
        let (engine, log, _pool, batches_done) = engine_with(true);
        let (ctrl, pack) = request_package(3);
        engine.run(pack);
        wait_until(2000, || ctrl.is_process_finished());
        assert_eq!(*log.lock(), vec!["pre", "mid"]);
        assert!(!ctrl.is_success());
        assert_eq!(batches_done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fork_shares_pool_but_not_state() {
        let (engine, log, _pool, _done) = engine_with(false);
        let fork = engine
            .fork(1, Arc::new(|_| {}))
            .expect("fork engine");
        let (ctrl, pack) = request_package(1);
        fork.run(pack);
        wait_until(2000, || ctrl.is_process_finished());
        assert_eq!(*log.lock(), vec!["pre", "mid", "post"]);
        assert!(engine.is_idle());
    }
}
