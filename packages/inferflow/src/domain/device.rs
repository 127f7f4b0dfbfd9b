//! Accelerator binding seam.
//!
//! The core never talks to a device SDK directly. Everything it needs
//! (raw allocation, the three copy directions, per-thread binding) goes
//! through [`DeviceAllocator`]. A [`SystemAllocator`] backed by the host
//! allocator ships for software runs and tests.

use std::alloc::{self, Layout};
use std::fmt;
use std::sync::Arc;

use crate::error::{InferError, Status};

/// Alignment of every allocation handed out by built-in allocators.
pub const BUFFER_ALIGN: usize = 64;

/// Raw memory operations of one accelerator.
///
/// Implementations wrap the vendor SDK; all pointer arguments follow the
/// usual contract that they came from this allocator (or host memory for
/// the host side of a copy) and stay valid for the duration of the call.
pub trait DeviceAllocator: Send + Sync {
    /// Allocate `size` bytes of device memory.
    fn alloc(&self, size: usize) -> Result<*mut u8, InferError>;

    /// Release memory previously returned by [`DeviceAllocator::alloc`].
    ///
    /// # Safety
    /// `ptr` must originate from `alloc` on this allocator with the same
    /// `size`, and must not be used afterwards.
    unsafe fn dealloc(&self, ptr: *mut u8, size: usize);

    /// Copy host memory into device memory.
    ///
    /// # Safety
    /// Both regions must be valid for `size` bytes.
    unsafe fn copy_to_device(&self, dst: *mut u8, src: *const u8, size: usize) -> Status;

    /// Copy device memory out to host memory.
    ///
    /// # Safety
    /// Both regions must be valid for `size` bytes.
    unsafe fn copy_from_device(&self, dst: *mut u8, src: *const u8, size: usize) -> Status;

    /// Copy between two device regions.
    ///
    /// # Safety
    /// Both regions must be valid for `size` bytes.
    unsafe fn copy_within_device(&self, dst: *mut u8, src: *const u8, size: usize) -> Status;

    /// Bind the calling thread to the device. Ran once per worker thread.
    fn bind_thread(&self) -> Status {
        Ok(())
    }
}

/// Host-allocator-backed [`DeviceAllocator`] for software pipelines.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl DeviceAllocator for SystemAllocator {
    fn alloc(&self, size: usize) -> Result<*mut u8, InferError> {
        let layout = Layout::from_size_align(size.max(1), BUFFER_ALIGN)
            .map_err(|e| InferError::Memory(format!("bad layout for {size} bytes: {e}")))?;
        // SAFETY: layout has non-zero size; zeroed so partially filled
        // staging buffers are always readable
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(InferError::Memory(format!("allocation of {size} bytes failed")));
        }
        Ok(ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, size: usize) {
        let layout = Layout::from_size_align(size.max(1), BUFFER_ALIGN)
            .expect("layout was valid at alloc time");
        unsafe { alloc::dealloc(ptr, layout) };
    }

    unsafe fn copy_to_device(&self, dst: *mut u8, src: *const u8, size: usize) -> Status {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
        Ok(())
    }

    unsafe fn copy_from_device(&self, dst: *mut u8, src: *const u8, size: usize) -> Status {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
        Ok(())
    }

    unsafe fn copy_within_device(&self, dst: *mut u8, src: *const u8, size: usize) -> Status {
        unsafe { std::ptr::copy(src, dst, size) };
        Ok(())
    }
}

/// One accelerator: a non-negative id plus its allocator.
#[derive(Clone)]
pub struct Device {
    id: i32,
    allocator: Arc<dyn DeviceAllocator>,
}

impl Device {
    /// Bind a device id to a custom allocator.
    pub fn new(id: i32, allocator: Arc<dyn DeviceAllocator>) -> Result<Self, InferError> {
        if id < 0 {
            return Err(InferError::InvalidParam(format!("no such device: {id}")));
        }
        Ok(Self { id, allocator })
    }

    /// A device backed by the host allocator.
    pub fn system(id: i32) -> Result<Self, InferError> {
        Self::new(id, Arc::new(SystemAllocator))
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_id_rejected() {
        assert!(Device::system(-1).is_err());
        assert!(Device::system(0).is_ok());
    }

    #[test]
    fn system_allocator_roundtrip() {
        let a = SystemAllocator;
        let p = a.alloc(128).unwrap();
        let src = [7u8; 128];
        let mut dst = [0u8; 128];
        unsafe {
            a.copy_to_device(p, src.as_ptr(), 128).unwrap();
            a.copy_from_device(dst.as_mut_ptr(), p, 128).unwrap();
            a.dealloc(p, 128);
        }
        assert_eq!(src, dst);
    }
}
