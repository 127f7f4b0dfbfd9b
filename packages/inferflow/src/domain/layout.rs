//! Element kinds, dim orders, and host-side layout transforms.

use half::f16;

use crate::domain::Shape;
use crate::error::{InferError, Status};

/// Element kind of model input and output data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    U8,
    I16,
    I32,
    F16,
    F32,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::I16 | DataType::F16 => 2,
            DataType::I32 | DataType::F32 => 4,
        }
    }
}

/// Dim order of model input and output data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimOrder {
    NCHW,
    NHWC,
    HWCN,
    TNC,
    NTC,
}

/// How data is laid out in a buffer: element kind plus dim order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLayout {
    pub dtype: DataType,
    pub order: DimOrder,
}

impl DataLayout {
    pub const fn new(dtype: DataType, order: DimOrder) -> Self {
        Self { dtype, order }
    }
}

fn read_elem(src: &[u8], dtype: DataType, idx: usize) -> f32 {
    let off = idx * dtype.size();
    match dtype {
        DataType::U8 => src[off] as f32,
        DataType::I16 => i16::from_ne_bytes([src[off], src[off + 1]]) as f32,
        DataType::I32 => {
            i32::from_ne_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]]) as f32
        }
        DataType::F16 => f16::from_ne_bytes([src[off], src[off + 1]]).to_f32(),
        DataType::F32 => f32::from_ne_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]]),
    }
}

fn write_elem(dst: &mut [u8], dtype: DataType, idx: usize, v: f32) {
    let off = idx * dtype.size();
    match dtype {
        DataType::U8 => dst[off] = v as u8,
        DataType::I16 => dst[off..off + 2].copy_from_slice(&(v as i16).to_ne_bytes()),
        DataType::I32 => dst[off..off + 4].copy_from_slice(&(v as i32).to_ne_bytes()),
        DataType::F16 => dst[off..off + 2].copy_from_slice(&f16::from_f32(v).to_ne_bytes()),
        DataType::F32 => dst[off..off + 4].copy_from_slice(&v.to_ne_bytes()),
    }
}

/// Axis permutation moving `shape`'s dims from `src` order into `dst`
/// order: entry `i` names the source axis feeding destination axis `i`.
fn trans_axes(src: DimOrder, dst: DimOrder, ndims: usize) -> Result<Vec<usize>, InferError> {
    for order in [src, dst] {
        if order != DimOrder::NHWC && order != DimOrder::NCHW {
            return Err(InferError::InvalidParam(format!(
                "layout transform supports NHWC and NCHW only, got {order:?}"
            )));
        }
    }
    let mut axes = vec![0usize; ndims];
    if dst == DimOrder::NHWC {
        for (i, a) in axes.iter_mut().enumerate().take(ndims - 1).skip(1) {
            *a = i + 1;
        }
        if ndims > 1 {
            axes[ndims - 1] = 1;
        }
    } else {
        if ndims > 1 {
            axes[1] = ndims - 1;
        }
        for (i, a) in axes.iter_mut().enumerate().skip(2) {
            *a = i - 1;
        }
    }
    Ok(axes)
}

/// Convert host data from one layout into another.
///
/// `shape` describes `src` in `src_layout.order`. Element kinds are cast
/// through f32; reordering is supported between NHWC and NCHW. When both
/// kind and order match this is a plain copy.
pub fn trans_layout(
    src: &[u8],
    src_layout: DataLayout,
    dst: &mut [u8],
    dst_layout: DataLayout,
    shape: &Shape,
) -> Status {
    let count = shape.elem_count().max(0) as usize;
    if src.len() < count * src_layout.dtype.size() {
        return Err(InferError::InvalidParam("layout transform: src too small".into()));
    }
    if dst.len() < count * dst_layout.dtype.size() {
        return Err(InferError::InvalidParam("layout transform: dst too small".into()));
    }

    let same_type = src_layout.dtype == dst_layout.dtype;
    let same_order = src_layout.order == dst_layout.order || shape.ndims() < 2;

    if same_type && same_order {
        dst[..count * src_layout.dtype.size()]
            .copy_from_slice(&src[..count * src_layout.dtype.size()]);
        return Ok(());
    }

    if same_order {
        for i in 0..count {
            let v = read_elem(src, src_layout.dtype, i);
            write_elem(dst, dst_layout.dtype, i, v);
        }
        return Ok(());
    }

    let ndims = shape.ndims();
    let axes = trans_axes(src_layout.order, dst_layout.order, ndims)?;
    let src_dims: Vec<usize> = shape.dims().iter().map(|&d| d.max(0) as usize).collect();
    let dst_dims: Vec<usize> = axes.iter().map(|&a| src_dims[a]).collect();

    // strides of the destination, outermost first
    let mut dst_strides = vec![1usize; ndims];
    for i in (0..ndims - 1).rev() {
        dst_strides[i] = dst_strides[i + 1] * dst_dims[i + 1];
    }

    let mut coords = vec![0usize; ndims];
    for i in 0..count {
        // decompose src linear index into coordinates
        let mut rem = i;
        for d in (0..ndims).rev() {
            coords[d] = rem % src_dims[d];
            rem /= src_dims[d];
        }
        let mut dst_idx = 0usize;
        for d in 0..ndims {
            dst_idx += coords[axes[d]] * dst_strides[d];
        }
        let v = read_elem(src, src_layout.dtype, i);
        write_elem(dst, dst_layout.dtype, dst_idx, v);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_sizes() {
        assert_eq!(DataType::U8.size(), 1);
        assert_eq!(DataType::I16.size(), 2);
        assert_eq!(DataType::F16.size(), 2);
        assert_eq!(DataType::I32.size(), 4);
        assert_eq!(DataType::F32.size(), 4);
    }

    #[test]
    fn cast_only() {
        let src: Vec<u8> = vec![0, 1, 2, 3];
        let mut dst = vec![0u8; 4 * 4];
        let s = Shape::new(&[1, 4]);
        trans_layout(
            &src,
            DataLayout::new(DataType::U8, DimOrder::NHWC),
            &mut dst,
            DataLayout::new(DataType::F32, DimOrder::NHWC),
            &s,
        )
        .unwrap();
        let vals: Vec<f32> = dst
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(vals, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn reorder_nhwc_to_nchw() {
        // 1x2x2x2 NHWC: [[a0 a1][b0 b1]; [c0 c1][d0 d1]]
        let src: Vec<u8> = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = vec![0u8; 8];
        let s = Shape::new(&[1, 2, 2, 2]);
        trans_layout(
            &src,
            DataLayout::new(DataType::U8, DimOrder::NHWC),
            &mut dst,
            DataLayout::new(DataType::U8, DimOrder::NCHW),
            &s,
        )
        .unwrap();
        // NCHW: channel 0 plane then channel 1 plane
        assert_eq!(dst, vec![1, 3, 5, 7, 2, 4, 6, 8]);
    }

    #[test]
    fn unsupported_order_rejected() {
        let src = vec![0u8; 8];
        let mut dst = vec![0u8; 8];
        let s = Shape::new(&[1, 2, 2, 2]);
        let r = trans_layout(
            &src,
            DataLayout::new(DataType::U8, DimOrder::TNC),
            &mut dst,
            DataLayout::new(DataType::U8, DimOrder::NCHW),
            &s,
        );
        assert!(matches!(r, Err(InferError::InvalidParam(_))));
    }

    #[test]
    fn f16_roundtrip() {
        let mut src = vec![0u8; 4];
        write_elem(&mut src, DataType::F16, 0, 1.5);
        write_elem(&mut src, DataType::F16, 1, -2.0);
        assert_eq!(read_elem(&src, DataType::F16, 0), 1.5);
        assert_eq!(read_elem(&src, DataType::F16, 1), -2.0);
    }
}
