//! The engine pipeline: stage interface, built-in stages, engines, and
//! the model layer.

pub(crate) mod engine;
pub mod model;
pub mod processor;
pub mod stages;

pub use model::{
    MODEL_CACHE_LIMIT_ENV, Model, ModelInfo, ModelLoader, ModelRegistry, ModelRunner, ModelSource,
};
pub use processor::{PassThrough, Processor, StageContext};
pub use stages::{PostprocessFn, Postprocessor, Predictor, PreprocessFn, Preprocessor};
