//! Multi-stage, batching, priority-aware inference serving core.
//!
//! Turns a stream of client requests (each a [`Package`] of data items
//! tagged by origin stream) into batches dispatched over a fixed
//! preprocess, predict, postprocess pipeline, and stitches per-item
//! outcomes back into per-request responses in arrival order.
//!
//! The moving parts:
//! - [`InferServer`]: one instance per device; deduplicates executors
//!   and shares one priority worker pool.
//! - [`Session`]: per-client handle enforcing response ordering, with
//!   an async observer or a synchronous wait.
//! - batching caches: cross-request ([`BatchStrategy::Dynamic`]) or
//!   in-request ([`BatchStrategy::Static`]) grouping.
//! - engines: N parallel forks of the stage pipeline per executor,
//!   each stage serialized on its own instance.
//! - [`Model`] / [`ModelRunner`] / [`ModelLoader`]: the seams where a
//!   device SDK plugs in; the core never parses model files or talks
//!   to drivers itself.

pub mod batch;
pub mod domain;
pub mod error;
pub mod perf;
pub mod pipeline;
pub mod pool;
pub mod serve;
pub mod util;

pub use batch::BatchStrategy;
pub use domain::{
    Buffer, DataLayout, DataType, Device, DeviceAllocator, DimOrder, InferData, MemoryType,
    ModelIo, Package, Shape, SystemAllocator, Value,
};
pub use error::{InferError, Status};
pub use perf::{LatencyStatistic, ThroughputStatistic};
pub use pipeline::{
    MODEL_CACHE_LIMIT_ENV, Model, ModelInfo, ModelLoader, ModelRegistry, ModelRunner, ModelSource,
    PassThrough, PostprocessFn, Postprocessor, Predictor, PreprocessFn, Preprocessor, Processor,
    StageContext,
};
pub use pool::{MemoryPool, Priority, PriorityThreadPool};
pub use serve::{InferServer, Observer, Session, SessionDesc, UserData};
