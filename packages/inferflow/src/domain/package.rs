//! Work units flowing through the pipeline: values, items, and batches.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{Buffer, Shape};
use crate::serve::RequestControl;

/// Input and output tensors of one inference call: parallel lists of
/// buffers and their shapes.
#[derive(Debug, Default, Clone)]
pub struct ModelIo {
    pub buffers: Vec<Buffer>,
    pub shapes: Vec<Shape>,
}

impl ModelIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Payload of one data item.
///
/// Replaces the type-erased container of classic pipelines with a tagged
/// variant: tensors for the built-in stages, a boxed user value for
/// everything else. Stage implementations downcast explicitly.
#[derive(Default)]
pub enum Value {
    /// Nothing stored (failed, discarded, or not yet produced).
    #[default]
    None,
    /// Tensor data exchanged with the model runner.
    Tensors(ModelIo),
    /// Arbitrary user payload.
    User(Box<dyn Any + Send>),
}

impl Value {
    /// Box a user payload.
    pub fn user<T: Any + Send>(v: T) -> Self {
        Value::User(Box::new(v))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_tensors(&self) -> Option<&ModelIo> {
        match self {
            Value::Tensors(io) => Some(io),
            _ => None,
        }
    }

    /// Borrow the user payload as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::User(b) => b.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Take the user payload out as `T`.
    pub fn downcast<T: Any>(self) -> Option<T> {
        match self {
            Value::User(b) => b.downcast::<T>().ok().map(|b| *b),
            _ => None,
        }
    }

    /// Move the value out, leaving `None` behind.
    pub fn take(&mut self) -> Value {
        std::mem::take(self)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Tensors(io) => write!(f, "Tensors({} buffers)", io.buffers.len()),
            Value::User(_) => write!(f, "User(..)"),
        }
    }
}

/// One data item: a payload plus its position within the request it
/// belongs to. The request link is attached on admission.
#[derive(Debug, Default)]
pub struct InferData {
    pub value: Value,
    pub(crate) ctrl: Option<Arc<RequestControl>>,
    pub(crate) index: u32,
}

impl InferData {
    pub fn new(value: Value) -> Self {
        Self { value, ctrl: None, index: 0 }
    }

    /// Item from a boxed user payload.
    pub fn from_user<T: Any + Send>(v: T) -> Self {
        Self::new(Value::user(v))
    }

    /// Index of this item within its request.
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Per-stage latency samples attached to a batch or a response,
/// keyed by stage name, in milliseconds.
pub type PerfMap = HashMap<&'static str, f32>;

/// A batch: an ordered list of items plus routing metadata.
///
/// Used both as the request unit handed to a session and as the unit
/// dispatched to engines after batching.
#[derive(Debug, Default)]
pub struct Package {
    /// Items of this batch.
    pub data: Vec<InferData>,
    /// Origin stream tag (stream id, client id, ...).
    pub tag: String,
    /// Contiguous tensor view carried between pipeline stages.
    pub predict_io: Option<ModelIo>,
    /// Per-stage latency samples.
    pub perf: PerfMap,
    pub(crate) priority: i64,
}

impl Package {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), ..Default::default() }
    }

    /// Package with room reserved for `data_num` items.
    pub fn with_capacity(data_num: usize, tag: impl Into<String>) -> Self {
        Self {
            data: Vec::with_capacity(data_num),
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append one item.
    pub fn push(&mut self, item: InferData) {
        self.data.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_downcast() {
        let v = Value::user(41u32);
        assert_eq!(v.downcast_ref::<u32>(), Some(&41));
        assert!(v.downcast_ref::<i64>().is_none());
        assert_eq!(v.downcast::<u32>(), Some(41));
    }

    #[test]
    fn value_take() {
        let mut v = Value::user("x".to_string());
        let taken = v.take();
        assert!(v.is_none());
        assert_eq!(taken.downcast_ref::<String>().map(String::as_str), Some("x"));
    }

    #[test]
    fn package_reserves() {
        let p = Package::with_capacity(8, "stream0");
        assert!(p.is_empty());
        assert!(p.data.capacity() >= 8);
        assert_eq!(p.tag, "stream0");
    }
}
