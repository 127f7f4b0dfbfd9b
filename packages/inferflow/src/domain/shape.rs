//! Tensor shape description for model inputs and outputs.

use std::fmt;
use std::ops::{Index, IndexMut};

use smallvec::SmallVec;

/// Ordered dimensions of one model input or output.
///
/// A dim value of 0 or below denotes a dynamic dimension that is only
/// resolved at run time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shape {
    dims: SmallVec<[i64; 8]>,
}

impl Shape {
    /// Build a shape from explicit dim values.
    pub fn new(dims: &[i64]) -> Self {
        Self { dims: SmallVec::from_slice(dims) }
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// True when the shape carries no dims at all.
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// True when any dimension is still unresolved.
    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(|&d| d <= 0)
    }

    /// All dim values in order.
    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// The leading (batch) dimension, 0 for an empty shape.
    pub fn batch_size(&self) -> i64 {
        self.dims.first().copied().unwrap_or(0)
    }

    /// Total element count, leading dimension included.
    pub fn elem_count(&self) -> i64 {
        self.dims.iter().product()
    }

    /// Element count of a single batch item, i.e. the product of every
    /// dimension except the leading one.
    pub fn batch_elem_count(&self) -> i64 {
        self.dims.iter().skip(1).product()
    }

    /// N of a 4-dim shape, 0 otherwise.
    pub fn n(&self) -> i64 {
        self.dim4(0)
    }

    /// H of a 4-dim shape, 0 otherwise.
    pub fn h(&self) -> i64 {
        self.dim4(1)
    }

    /// W of a 4-dim shape, 0 otherwise.
    pub fn w(&self) -> i64 {
        self.dim4(2)
    }

    /// C of a 4-dim shape, 0 otherwise.
    pub fn c(&self) -> i64 {
        self.dim4(3)
    }

    fn dim4(&self, idx: usize) -> i64 {
        if self.ndims() == 4 { self.dims[idx] } else { 0 }
    }
}

impl Index<usize> for Shape {
    type Output = i64;

    fn index(&self, idx: usize) -> &i64 {
        &self.dims[idx]
    }
}

impl IndexMut<usize> for Shape {
    fn index_mut(&mut self, idx: usize) -> &mut i64 {
        &mut self.dims[idx]
    }
}

impl From<Vec<i64>> for Shape {
    fn from(dims: Vec<i64>) -> Self {
        Self { dims: SmallVec::from_vec(dims) }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}
