//! Pipeline stage interface.

use std::sync::Arc;

use crate::domain::{DataLayout, DataType, Device, DimOrder, Package};
use crate::error::{InferError, Status};
use crate::pipeline::model::Model;

/// Execution environment a stage is bound to at init time.
#[derive(Clone)]
pub struct StageContext {
    pub model: Arc<dyn Model>,
    pub device: Device,
    /// Layout of host-side input data handed to the preprocess stage.
    pub host_input_layout: DataLayout,
    /// Layout of host-side output data produced by the postprocess stage.
    pub host_output_layout: DataLayout,
}

impl StageContext {
    pub(crate) fn defaults(model: Arc<dyn Model>, device: Device) -> Self {
        Self {
            model,
            device,
            host_input_layout: DataLayout::new(DataType::U8, DimOrder::NHWC),
            host_output_layout: DataLayout::new(DataType::F32, DimOrder::NHWC),
        }
    }
}

/// One stage of the pipeline.
///
/// A stage instance processes at most one batch at a time; the engine
/// serializes calls with a per-node mutex because the stage owns device
/// state (queues, staging buffers). Each engine runs its own fork.
pub trait Processor: Send {
    /// Stable name used in logs and latency reports.
    fn type_name(&self) -> &'static str;

    /// Bind the stage to its executor's model and device.
    fn init(&mut self, ctx: &StageContext) -> Status;

    /// Handle one batch in place.
    fn process(&mut self, pack: &mut Package) -> Status;

    /// Independent instance sharing this stage's parameters but owning
    /// its own device state. Returned forks are already initialized.
    fn fork(&self) -> Result<Box<dyn Processor>, InferError>;
}

/// Stage that forwards batches untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl Processor for PassThrough {
    fn type_name(&self) -> &'static str {
        "PassThrough"
    }

    fn init(&mut self, _ctx: &StageContext) -> Status {
        Ok(())
    }

    fn process(&mut self, _pack: &mut Package) -> Status {
        Ok(())
    }

    fn fork(&self) -> Result<Box<dyn Processor>, InferError> {
        Ok(Box::new(PassThrough))
    }
}
