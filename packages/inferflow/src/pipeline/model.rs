//! Model abstraction and the per-server model registry.
//!
//! Model file parsing and the device SDK stay outside the core: a
//! [`ModelLoader`] turns a path or byte slice into a [`Model`], and each
//! engine gets its own [`ModelRunner`] owning one device command queue.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use log::info;

use crate::domain::{DataLayout, Device, ModelIo, Shape};
use crate::error::{InferError, Status};
use crate::util::env::from_env;

/// Read-only description of a compiled model.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Identifier used for executor dedup and diagnostics.
    pub key: String,
    pub input_shapes: Vec<Shape>,
    pub output_shapes: Vec<Shape>,
    pub input_layouts: Vec<DataLayout>,
    pub output_layouts: Vec<DataLayout>,
    /// Fixed batch size the model was compiled for.
    pub batch_size: u32,
}

impl ModelInfo {
    pub fn input_num(&self) -> usize {
        self.input_shapes.len()
    }

    pub fn output_num(&self) -> usize {
        self.output_shapes.len()
    }
}

/// A loaded model. Implementations wrap the compiled model handle of
/// the device SDK.
pub trait Model: Send + Sync {
    fn info(&self) -> &ModelInfo;

    /// New runner bound to `device`, owning its own command queue.
    /// Each engine forks its own runner so engines run in parallel.
    fn create_runner(&self, device: &Device) -> Result<Box<dyn ModelRunner>, InferError>;
}

/// Per-engine execution handle of one model.
pub trait ModelRunner: Send {
    /// Submit one input/output tensor set and block the calling thread
    /// until the device completes.
    fn run(&mut self, inputs: &mut ModelIo, outputs: &mut ModelIo) -> Status;
}

/// Where a model comes from.
#[derive(Debug, Clone, Copy)]
pub enum ModelSource<'a> {
    Path(&'a Path),
    Memory(&'a [u8]),
}

/// Seam for turning a model source into a loaded model.
pub trait ModelLoader: Send + Sync {
    fn load(&self, source: ModelSource<'_>, device: &Device) -> Result<Arc<dyn Model>, InferError>;
}

/// Environment variable bounding the registry size.
pub const MODEL_CACHE_LIMIT_ENV: &str = "MODEL_CACHE_LIMIT";

/// Process-local model cache, owned by a server instance.
///
/// Bounded by `MODEL_CACHE_LIMIT` (default 10): when an insert would
/// exceed the bound, the first cached model with no outside references
/// is evicted. Models still in use are never destroyed by eviction.
#[derive(Default)]
pub struct ModelRegistry {
    cache: DashMap<String, Arc<dyn Model>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn source_key(source: &ModelSource<'_>) -> String {
        match source {
            ModelSource::Path(p) => p.display().to_string(),
            ModelSource::Memory(bytes) => format!("{:x}", md5::compute(bytes)),
        }
    }

    /// Load through `loader`, reusing the cached model when the source
    /// was seen before.
    pub fn load(
        &self,
        loader: &dyn ModelLoader,
        source: ModelSource<'_>,
        device: &Device,
    ) -> Result<Arc<dyn Model>, InferError> {
        let key = Self::source_key(&source);
        if let Some(model) = self.cache.get(&key) {
            info!("get model from cache: {key}");
            return Ok(Arc::clone(&model));
        }
        info!("load model: {key}");
        let model = loader.load(source, device)?;
        self.check_and_clean();
        self.cache.insert(key, Arc::clone(&model));
        Ok(model)
    }

    fn check_and_clean(&self) {
        let limit: usize = from_env(MODEL_CACHE_LIMIT_ENV, 10);
        if self.cache.len() < limit {
            return;
        }
        let victim = self
            .cache
            .iter()
            .find(|entry| Arc::strong_count(entry.value()) == 1)
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            info!("model cache full, evict {key}");
            self.cache.remove(&key);
        }
    }

    /// Remove a model from the cache; it lives on while sessions hold it.
    pub fn unload(&self, model: &Arc<dyn Model>) -> bool {
        let key = self
            .cache
            .iter()
            .find(|entry| Arc::ptr_eq(entry.value(), model))
            .map(|entry| entry.key().clone());
        match key {
            Some(key) => self.cache.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
