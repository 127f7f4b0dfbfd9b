//! Shared fixtures: a software test model, stage hooks moving f32
//! payloads through the pipeline, and a recording observer.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use inferflow::{
    BatchStrategy, DataLayout, DataType, Device, DimOrder, InferData, InferError, Model, ModelIo,
    ModelInfo, ModelRunner, Observer, Package, PostprocessFn, Postprocessor, PreprocessFn,
    Preprocessor, SessionDesc, Shape, Status, UserData, Value,
};

pub const ITEM_ELEMS: usize = 4;
const F32_NHWC: DataLayout = DataLayout::new(DataType::F32, DimOrder::NHWC);

/// Software model echoing its input after an optional delay.
pub struct TestModel {
    info: ModelInfo,
    delay: Duration,
    runs: Arc<AtomicUsize>,
}

impl TestModel {
    pub fn new(key: &str, batch_size: u32, delay: Duration) -> Arc<Self> {
        let shape = Shape::new(&[batch_size as i64, ITEM_ELEMS as i64]);
        Arc::new(Self {
            info: ModelInfo {
                key: key.to_string(),
                input_shapes: vec![shape.clone()],
                output_shapes: vec![shape],
                input_layouts: vec![F32_NHWC],
                output_layouts: vec![F32_NHWC],
                batch_size,
            },
            delay,
            runs: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Batches executed so far, across every engine.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

struct TestRunner {
    delay: Duration,
    runs: Arc<AtomicUsize>,
}

impl ModelRunner for TestRunner {
    fn run(&mut self, inputs: &mut ModelIo, outputs: &mut ModelIo) -> Status {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        for (src, dst) in inputs.buffers.iter().zip(outputs.buffers.iter_mut()) {
            let n = src.size().min(dst.size());
            dst.copy_from(src, n)?;
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Model for TestModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn create_runner(&self, _device: &Device) -> Result<Box<dyn ModelRunner>, InferError> {
        Ok(Box::new(TestRunner { delay: self.delay, runs: Arc::clone(&self.runs) }))
    }
}

/// Per-item preprocess: replicate the item's f32 payload across its
/// input slice.
pub fn preproc_fn() -> PreprocessFn {
    Arc::new(|view, item, _info| {
        let v = *item
            .value
            .downcast_ref::<f32>()
            .ok_or_else(|| InferError::WrongType("expected f32 payload".into()))?;
        let bytes: Vec<u8> = (0..ITEM_ELEMS).flat_map(|_| v.to_ne_bytes()).collect();
        view.buffers[0].copy_from_slice(&bytes)
    })
}

/// Per-item postprocess: read the first f32 of the item's output slice.
pub fn postproc_fn() -> PostprocessFn {
    Arc::new(|item, view, _info| {
        let bytes = view.buffers[0].host_slice()?;
        let v = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        item.value = Value::user(v);
        Ok(())
    })
}

/// Session descriptor wired to the test model and f32 stage hooks.
pub fn desc_for(
    name: &str,
    model: &Arc<TestModel>,
    strategy: BatchStrategy,
    batch_timeout: Duration,
    engine_num: u32,
) -> SessionDesc {
    SessionDesc {
        name: name.to_string(),
        model: Some(Arc::clone(model) as Arc<dyn Model>),
        strategy,
        host_input_layout: F32_NHWC,
        host_output_layout: F32_NHWC,
        preproc: Some(Box::new(Preprocessor::new(preproc_fn()))),
        postproc: Some(Box::new(Postprocessor::new(postproc_fn()))),
        batch_timeout,
        priority: 0,
        engine_num,
        show_perf: false,
    }
}

/// Request package carrying one f32 item per value.
pub fn package_with(tag: &str, values: &[f32]) -> Package {
    let mut pack = Package::with_capacity(values.len(), tag);
    for &v in values {
        pack.push(InferData::from_user(v));
    }
    pack
}

/// One delivered response.
#[derive(Debug, Clone)]
pub struct Event {
    pub status: Status,
    pub tag: String,
    pub values: Vec<f32>,
    pub user: Option<i64>,
    pub at: Instant,
}

/// Observer collecting responses for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
    cond: Condvar,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until `n` responses arrived, panicking after `timeout`.
    pub fn wait_events(&self, n: usize, timeout: Duration) -> Vec<Event> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while events.len() < n {
            assert!(
                !self.cond.wait_until(&mut events, deadline).timed_out(),
                "expected {n} responses, got {} in {timeout:?}",
                events.len()
            );
        }
        events.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl Observer for RecordingObserver {
    fn on_response(&self, status: Status, response: Package, user_data: UserData) {
        let values = response
            .data
            .iter()
            .filter_map(|item| item.value.downcast_ref::<f32>().copied())
            .collect();
        let user = user_data.and_then(|u| u.downcast_ref::<i64>().copied());
        let mut events = self.events.lock();
        events.push(Event {
            status,
            tag: response.tag.clone(),
            values,
            user,
            at: Instant::now(),
        });
        self.cond.notify_all();
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
