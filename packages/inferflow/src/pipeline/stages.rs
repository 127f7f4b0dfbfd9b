//! Built-in pipeline stages: host preprocess, predict, host postprocess.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::domain::{Buffer, InferData, ModelIo, Package, Shape, Value, trans_layout};
use crate::error::{InferError, Status};
use crate::pipeline::model::ModelInfo;
use crate::pipeline::processor::{Processor, StageContext};
use crate::pool::{MemoryPool, PriorityThreadPool};

/// Per-item preprocess hook: fill the item's slice of the batched model
/// input from the item's payload.
pub type PreprocessFn = Arc<dyn Fn(&mut ModelIo, &InferData, &ModelInfo) -> Status + Send + Sync>;

/// Per-item postprocess hook: turn the item's slice of the batched
/// model output into the item's result value.
pub type PostprocessFn = Arc<dyn Fn(&mut InferData, &ModelIo, &ModelInfo) -> Status + Send + Sync>;

// postprocess fan-out shares one host pool across all sessions so that
// device pool workers are never consumed by host-side work
static HOST_POOL: Lazy<PriorityThreadPool> =
    Lazy::new(|| PriorityThreadPool::new(None, num_cpus::get().clamp(1, 8)));

fn item_shape(batch: &Shape) -> Shape {
    let mut dims = batch.dims().to_vec();
    if !dims.is_empty() {
        dims[0] = 1;
    }
    Shape::from(dims)
}

fn with_batch(shape: &Shape, batch_size: usize) -> Shape {
    let mut dims = shape.dims().to_vec();
    if !dims.is_empty() {
        dims[0] = batch_size as i64;
    }
    Shape::from(dims)
}

// -------------------- Preprocessor --------------------

/// Host preprocess stage.
///
/// Runs the user hook once per item against a view into per-input host
/// staging buffers, then assembles the staged data into contiguous
/// device tensors (converting from the host input layout to the model
/// input layout on the way). Without a hook the stage forwards batches
/// untouched, which fits prefilled prediction IO under the static
/// strategy.
#[derive(Default)]
pub struct Preprocessor {
    process_fn: Option<PreprocessFn>,
    ctx: Option<StageContext>,
}

impl Preprocessor {
    pub fn new(process_fn: PreprocessFn) -> Self {
        Self { process_fn: Some(process_fn), ctx: None }
    }
}

impl Processor for Preprocessor {
    fn type_name(&self) -> &'static str {
        "Preprocessor"
    }

    fn init(&mut self, ctx: &StageContext) -> Status {
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    fn process(&mut self, pack: &mut Package) -> Status {
        let Some(process_fn) = self.process_fn.clone() else {
            return Ok(());
        };
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| InferError::Backend("preprocessor not initialized".into()))?;
        let info = ctx.model.info();
        let batch = pack.data.len();
        if batch == 0 {
            return Ok(());
        }

        // per-input host staging, one item span at a time
        let host_layout = ctx.host_input_layout;
        let mut staging = Vec::with_capacity(info.input_num());
        let mut spans = Vec::with_capacity(info.input_num());
        for i in 0..info.input_num() {
            let span = info.input_shapes[i].batch_elem_count() as usize * host_layout.dtype.size();
            let mut buf = Buffer::on_host(span * batch)?;
            buf.host_slice_mut()?;
            staging.push(buf);
            spans.push(span);
        }
        for (idx, item) in pack.data.iter().enumerate() {
            let mut view = ModelIo::new();
            for i in 0..info.input_num() {
                view.buffers.push(staging[i].slice(idx * spans[i])?);
                view.shapes.push(item_shape(&info.input_shapes[i]));
            }
            process_fn(&mut view, item, info)?;
        }

        // assemble contiguous device input in the model's layout
        let mut io = ModelIo::new();
        for i in 0..info.input_num() {
            let shape = with_batch(&info.input_shapes[i], batch);
            let model_layout = info.input_layouts[i];
            let elems = shape.elem_count() as usize;
            let staged = if host_layout == model_layout {
                staging[i].clone()
            } else {
                let mut converted = Buffer::on_host(elems * model_layout.dtype.size())?;
                trans_layout(
                    staging[i].host_slice()?,
                    host_layout,
                    converted.host_slice_mut()?,
                    model_layout,
                    &shape,
                )?;
                converted
            };
            let size = elems * model_layout.dtype.size();
            let mut device_buf = Buffer::on_device(size, &ctx.device)?;
            device_buf.copy_from(&staged, size)?;
            io.buffers.push(device_buf);
            io.shapes.push(shape);
        }
        pack.predict_io = Some(io);
        Ok(())
    }

    fn fork(&self) -> Result<Box<dyn Processor>, InferError> {
        let mut fork = Preprocessor { process_fn: self.process_fn.clone(), ctx: None };
        if let Some(ctx) = &self.ctx {
            fork.init(ctx)?;
        }
        Ok(Box::new(fork))
    }
}

// -------------------- Predictor --------------------

/// Model execution stage.
///
/// Owns a forked model runner (one device queue per engine) and one
/// recycling pool per model output. Each call acquires output buffers
/// from the pools and blocks on the runner until the device completes.
#[derive(Default)]
pub struct Predictor {
    ctx: Option<StageContext>,
    runner: Option<Box<dyn crate::pipeline::model::ModelRunner>>,
    output_pools: Vec<MemoryPool>,
}

impl Predictor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Processor for Predictor {
    fn type_name(&self) -> &'static str {
        "Predictor"
    }

    fn init(&mut self, ctx: &StageContext) -> Status {
        let info = ctx.model.info();
        self.runner = Some(ctx.model.create_runner(&ctx.device)?);
        self.output_pools = (0..info.output_num())
            .map(|i| {
                let size =
                    info.output_shapes[i].elem_count() as usize * info.output_layouts[i].dtype.size();
                MemoryPool::new(size, 3, &ctx.device)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    fn process(&mut self, pack: &mut Package) -> Status {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| InferError::Backend("predictor not initialized".into()))?;
        let runner = self
            .runner
            .as_mut()
            .ok_or_else(|| InferError::Backend("predictor not initialized".into()))?;
        let Some(inputs) = pack.predict_io.as_mut() else {
            return Err(InferError::InvalidParam(
                "predictor can process contiguous data only".into(),
            ));
        };
        let info = ctx.model.info();
        let mut outputs = ModelIo::new();
        for (i, pool) in self.output_pools.iter().enumerate() {
            outputs.buffers.push(pool.acquire(None)?);
            outputs.shapes.push(info.output_shapes[i].clone());
        }
        runner.run(inputs, &mut outputs)?;
        pack.predict_io = Some(outputs);
        Ok(())
    }

    fn fork(&self) -> Result<Box<dyn Processor>, InferError> {
        let mut fork = Predictor::new();
        if let Some(ctx) = &self.ctx {
            fork.init(ctx)?;
        }
        Ok(Box::new(fork))
    }
}

// -------------------- Postprocessor --------------------

/// Host postprocess stage.
///
/// Brings the batched model output back to the host (converting into
/// the session's output layout), then runs the user hook once per item
/// against that item's slice. Without a hook each item receives its
/// tensor slice directly. With `with_parallel`, per-item hooks fan out
/// across the shared host pool; hooks must not panic.
#[derive(Default)]
pub struct Postprocessor {
    process_fn: Option<PostprocessFn>,
    ctx: Option<StageContext>,
    parallel: usize,
}

impl Postprocessor {
    pub fn new(process_fn: PostprocessFn) -> Self {
        Self { process_fn: Some(process_fn), ctx: None, parallel: 0 }
    }

    /// Fan per-item hooks out across up to `parallel` host workers.
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }
}

impl Postprocessor {
    fn item_view(host_io: &ModelIo, spans: &[usize], idx: usize) -> Result<ModelIo, InferError> {
        let mut view = ModelIo::new();
        for o in 0..host_io.buffers.len() {
            view.buffers.push(host_io.buffers[o].slice(idx * spans[o])?);
            view.shapes.push(item_shape(&host_io.shapes[o]));
        }
        Ok(view)
    }
}

impl Processor for Postprocessor {
    fn type_name(&self) -> &'static str {
        "Postprocessor"
    }

    fn init(&mut self, ctx: &StageContext) -> Status {
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    fn process(&mut self, pack: &mut Package) -> Status {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| InferError::Backend("postprocessor not initialized".into()))?;
        let Some(io) = pack.predict_io.take() else {
            return Err(InferError::InvalidParam(
                "postprocessor can process predicted data only".into(),
            ));
        };
        let info = ctx.model.info();
        let batch = pack.data.len();
        if batch == 0 {
            return Ok(());
        }

        // device output → host, in the session's output layout
        let host_layout = ctx.host_output_layout;
        let mut host_io = ModelIo::new();
        let mut spans = Vec::with_capacity(io.buffers.len());
        for (o, device_buf) in io.buffers.iter().enumerate() {
            let shape = io.shapes[o].clone();
            let model_layout = info.output_layouts[o];
            let model_bytes = shape.elem_count() as usize * model_layout.dtype.size();
            let mut host_buf = Buffer::on_host(model_bytes)?;
            host_buf.copy_from(device_buf, model_bytes)?;
            let final_buf = if model_layout == host_layout {
                host_buf
            } else {
                let mut converted =
                    Buffer::on_host(shape.elem_count() as usize * host_layout.dtype.size())?;
                trans_layout(
                    host_buf.host_slice()?,
                    model_layout,
                    converted.host_slice_mut()?,
                    host_layout,
                    &shape,
                )?;
                converted
            };
            spans.push(shape.batch_elem_count() as usize * host_layout.dtype.size());
            host_io.buffers.push(final_buf);
            host_io.shapes.push(shape);
        }

        let Some(process_fn) = self.process_fn.clone() else {
            // no user hook: every item gets its slice of the output
            for (idx, item) in pack.data.iter_mut().enumerate() {
                item.value = Value::Tensors(Self::item_view(&host_io, &spans, idx)?);
            }
            return Ok(());
        };

        if self.parallel > 1 && batch > 1 {
            let items = std::mem::take(&mut pack.data);
            let futures: Vec<_> = items
                .into_iter()
                .enumerate()
                .map(|(idx, mut item)| {
                    let view = Self::item_view(&host_io, &spans, idx);
                    let process_fn = Arc::clone(&process_fn);
                    let model = Arc::clone(&ctx.model);
                    HOST_POOL.push(0, move || {
                        let status = match view {
                            Ok(view) => process_fn(&mut item, &view, model.info()),
                            Err(e) => Err(e),
                        };
                        (item, status)
                    })
                })
                .collect();
            let mut status: Status = Ok(());
            for fut in futures {
                match fut.wait() {
                    Ok((item, s)) => {
                        if s.is_err() && status.is_ok() {
                            status = s;
                        }
                        pack.data.push(item);
                    }
                    Err(e) => {
                        if status.is_ok() {
                            status = Err(e);
                        }
                    }
                }
            }
            status
        } else {
            for (idx, item) in pack.data.iter_mut().enumerate() {
                let view = Self::item_view(&host_io, &spans, idx)?;
                process_fn(item, &view, info)?;
            }
            Ok(())
        }
    }

    fn fork(&self) -> Result<Box<dyn Processor>, InferError> {
        let mut fork = Postprocessor {
            process_fn: self.process_fn.clone(),
            ctx: None,
            parallel: self.parallel,
        };
        if let Some(ctx) = &self.ctx {
            fork.init(ctx)?;
        }
        Ok(Box::new(fork))
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::{DataLayout, DataType, Device, DimOrder};
    use crate::pipeline::model::{Model, ModelRunner};

    use super::*;

    struct EchoModel {
        info: ModelInfo,
    }

    impl EchoModel {
        fn new() -> Arc<Self> {
            let layout = DataLayout::new(DataType::F32, DimOrder::NHWC);
            Arc::new(Self {
                info: ModelInfo {
                    key: "echo".into(),
                    input_shapes: vec![Shape::new(&[4, 4])],
                    output_shapes: vec![Shape::new(&[4, 4])],
                    input_layouts: vec![layout],
                    output_layouts: vec![layout],
                    batch_size: 4,
                },
            })
        }
    }

    struct EchoRunner;

    impl ModelRunner for EchoRunner {
        fn run(&mut self, inputs: &mut ModelIo, outputs: &mut ModelIo) -> Status {
            for (src, dst) in inputs.buffers.iter().zip(outputs.buffers.iter_mut()) {
                let n = src.size().min(dst.size());
                dst.copy_from(src, n)?;
            }
            Ok(())
        }
    }

    impl Model for EchoModel {
        fn info(&self) -> &ModelInfo {
            &self.info
        }

        fn create_runner(
            &self,
            _device: &Device,
        ) -> Result<Box<dyn ModelRunner>, InferError> {
            Ok(Box::new(EchoRunner))
        }
    }

    fn f32_ctx() -> StageContext {
        let mut ctx =
            StageContext::defaults(EchoModel::new(), Device::system(0).unwrap());
        ctx.host_input_layout = DataLayout::new(DataType::F32, DimOrder::NHWC);
        ctx.host_output_layout = DataLayout::new(DataType::F32, DimOrder::NHWC);
        ctx
    }

    fn run_pipeline(parallel: usize) {
        let ctx = f32_ctx();

        let pre: PreprocessFn = Arc::new(|view, item, _info| {
            let v = *item.value.downcast_ref::<f32>().unwrap();
            let bytes: Vec<u8> = std::iter::repeat(v)
                .take(4)
                .flat_map(|x| x.to_ne_bytes())
                .collect();
            view.buffers[0].copy_from_slice(&bytes)
        });
        let post: PostprocessFn = Arc::new(|item, view, _info| {
            let bytes = view.buffers[0].host_slice()?;
            let first = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            item.value = Value::user(first * 10.0);
            Ok(())
        });

        let mut preproc = Preprocessor::new(pre);
        preproc.init(&ctx).unwrap();
        let mut predictor = Predictor::new();
        predictor.init(&ctx).unwrap();
        let mut postproc = Postprocessor::new(post).with_parallel(parallel);
        postproc.init(&ctx).unwrap();

        let mut pack = Package::new("t");
        for i in 0..3 {
            pack.push(InferData::from_user(i as f32 + 1.0));
        }
        preproc.process(&mut pack).unwrap();
        assert!(pack.predict_io.is_some());
        predictor.process(&mut pack).unwrap();
        postproc.process(&mut pack).unwrap();

        let got: Vec<f32> =
            pack.data.iter().map(|d| *d.value.downcast_ref::<f32>().unwrap()).collect();
        assert_eq!(got, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn three_stage_pipeline_serial() {
        run_pipeline(0);
    }

    #[test]
    fn three_stage_pipeline_parallel_postproc() {
        run_pipeline(4);
    }

    #[test]
    fn predictor_rejects_missing_predict_io() {
        let ctx = f32_ctx();
        let mut predictor = Predictor::new();
        predictor.init(&ctx).unwrap();
        let mut pack = Package::new("t");
        pack.push(InferData::from_user(1.0f32));
        assert!(matches!(
            predictor.process(&mut pack),
            Err(InferError::InvalidParam(_))
        ));
    }

    #[test]
    fn forks_are_independent_and_initialized() {
        let ctx = f32_ctx();
        let mut predictor = Predictor::new();
        predictor.init(&ctx).unwrap();
        let mut fork = predictor.fork().unwrap();
        let mut pack = Package::new("t");
        pack.push(InferData::from_user(1.0f32));
        let mut preproc = Preprocessor::new(Arc::new(|view, _item, _info| {
            view.buffers[0].copy_from_slice(&[0u8; 16])
        }));
        preproc.init(&ctx).unwrap();
        preproc.process(&mut pack).unwrap();
        fork.process(&mut pack).unwrap();
        assert!(pack.predict_io.is_some());
    }

}
