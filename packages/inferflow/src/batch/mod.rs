//! Batching layer: the item accumulator and the two cache strategies.

pub(crate) mod batcher;
pub(crate) mod cache;

use std::fmt;

pub(crate) use cache::{Cache, DynamicCache, StaticCache};

/// How inbound items are grouped into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchStrategy {
    /// Cross-request batching: items of concurrent requests are merged
    /// until the model batch size or the batch timeout is reached.
    #[default]
    Dynamic,
    /// In-request batching: a request is split into at-most-batch-size
    /// groups but never mixed with other requests.
    Static,
}

impl fmt::Display for BatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStrategy::Dynamic => write!(f, "dynamic"),
            BatchStrategy::Static => write!(f, "static"),
        }
    }
}
