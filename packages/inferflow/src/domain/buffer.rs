//! Reference-counted memory handles shared across pipeline stages.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use log::trace;

use crate::domain::device::{Device, DeviceAllocator, SystemAllocator};
use crate::error::{InferError, Status};

/// Where a buffer's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Host,
    Device,
}

/// Deallocator for adopted memory, invoked exactly once when the last
/// handle drops.
pub type MemoryDeallocator = Box<dyn FnOnce(*mut u8) + Send>;

struct Memory {
    data: AtomicPtr<u8>,
    len: usize,
    device: Option<Device>,
    // set for adopted memory only; owned memory frees through its allocator
    foreign: Option<MemoryDeallocator>,
}

// Memory hands out raw pointers but all mutation goes through the
// caller-side exclusive-ownership contract documented on Buffer.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    fn get(&self) -> Option<*mut u8> {
        let p = self.data.load(Ordering::Acquire);
        if p.is_null() { None } else { Some(p) }
    }

    /// Allocate on first use. Losing the publication race frees the
    /// redundant allocation and adopts the winner's pointer.
    fn ensure(&self) -> Result<*mut u8, InferError> {
        if let Some(p) = self.get() {
            return Ok(p);
        }
        let fresh = match &self.device {
            None => SystemAllocator.alloc(self.len)?,
            Some(dev) => dev.allocator().alloc(self.len)?,
        };
        match self
            .data
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                trace!("alloc {} bytes ({:?})", self.len, self.device.as_ref().map(Device::id));
                Ok(fresh)
            }
            Err(current) => {
                unsafe {
                    match &self.device {
                        None => SystemAllocator.dealloc(fresh, self.len),
                        Some(dev) => dev.allocator().dealloc(fresh, self.len),
                    }
                }
                Ok(current)
            }
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let ptr = *self.data.get_mut();
        if ptr.is_null() {
            return;
        }
        if let Some(dealloc) = self.foreign.take() {
            dealloc(ptr);
            return;
        }
        unsafe {
            match &self.device {
                None => SystemAllocator.dealloc(ptr, self.len),
                Some(dev) => dev.allocator().dealloc(ptr, self.len),
            }
        }
    }
}

/// A shared handle over one contiguous byte region, host or device.
///
/// Cloning is shallow: every clone shares the same storage.
/// [`Buffer::slice`] produces a view with an advanced offset over the
/// same storage. Sized constructors defer the actual allocation until
/// first mutable access.
///
/// Byte access is not synchronized; callers must not mutate a buffer
/// they do not exclusively own.
#[derive(Clone, Default)]
pub struct Buffer {
    mem: Option<Arc<Memory>>,
    size: usize,
    offset: usize,
}

impl Buffer {
    /// Host buffer of `size` bytes, allocated lazily.
    pub fn on_host(size: usize) -> Result<Self, InferError> {
        if size == 0 {
            return Err(InferError::InvalidParam("memory cannot be empty".into()));
        }
        Ok(Self {
            mem: Some(Arc::new(Memory {
                data: AtomicPtr::new(ptr::null_mut()),
                len: size,
                device: None,
                foreign: None,
            })),
            size,
            offset: 0,
        })
    }

    /// Device buffer of `size` bytes, allocated lazily on `device`.
    pub fn on_device(size: usize, device: &Device) -> Result<Self, InferError> {
        if size == 0 {
            return Err(InferError::InvalidParam("memory cannot be empty".into()));
        }
        Ok(Self {
            mem: Some(Arc::new(Memory {
                data: AtomicPtr::new(ptr::null_mut()),
                len: size,
                device: Some(device.clone()),
                foreign: None,
            })),
            size,
            offset: 0,
        })
    }

    /// Wrap caller-owned host memory. `dealloc` runs exactly once when
    /// the last handle drops.
    pub fn adopt_host(
        data: *mut u8,
        size: usize,
        dealloc: MemoryDeallocator,
    ) -> Result<Self, InferError> {
        if data.is_null() || size == 0 {
            return Err(InferError::InvalidParam("memory cannot be empty".into()));
        }
        Ok(Self {
            mem: Some(Arc::new(Memory {
                data: AtomicPtr::new(data),
                len: size,
                device: None,
                foreign: Some(dealloc),
            })),
            size,
            offset: 0,
        })
    }

    /// Wrap caller-owned device memory. `dealloc` runs exactly once when
    /// the last handle drops.
    pub fn adopt_device(
        data: *mut u8,
        size: usize,
        device: &Device,
        dealloc: MemoryDeallocator,
    ) -> Result<Self, InferError> {
        if data.is_null() || size == 0 {
            return Err(InferError::InvalidParam("memory cannot be empty".into()));
        }
        Ok(Self {
            mem: Some(Arc::new(Memory {
                data: AtomicPtr::new(data),
                len: size,
                device: Some(device.clone()),
                foreign: Some(dealloc),
            })),
            size,
            offset: 0,
        })
    }

    /// Bytes visible through this handle (total size minus view offset).
    pub fn size(&self) -> usize {
        self.size - self.offset
    }

    pub fn memory_type(&self) -> MemoryType {
        match self.mem.as_ref().and_then(|m| m.device.as_ref()) {
            Some(_) => MemoryType::Device,
            None => MemoryType::Host,
        }
    }

    pub fn is_on_device(&self) -> bool {
        self.memory_type() == MemoryType::Device
    }

    /// Owning device id, -1 for host memory.
    pub fn device_id(&self) -> i32 {
        self.mem
            .as_ref()
            .and_then(|m| m.device.as_ref())
            .map_or(-1, Device::id)
    }

    /// True once backing storage exists.
    pub fn owns_memory(&self) -> bool {
        self.mem.as_ref().is_some_and(|m| m.get().is_some())
    }

    /// Shallow view advanced by `offset` bytes over the same storage.
    pub fn slice(&self, offset: usize) -> Result<Self, InferError> {
        if self.offset + offset >= self.size {
            return Err(InferError::InvalidParam("offset out of range".into()));
        }
        Ok(Self {
            mem: self.mem.clone(),
            size: self.size,
            offset: self.offset + offset,
        })
    }

    fn memory(&self) -> Result<&Arc<Memory>, InferError> {
        self.mem
            .as_ref()
            .ok_or_else(|| InferError::Memory("buffer not initialized".into()))
    }

    /// Raw pointer to the view, allocating on first call.
    pub fn mutable_ptr(&mut self) -> Result<*mut u8, InferError> {
        let mem = self.memory()?;
        let base = mem.ensure()?;
        // SAFETY: offset < len, checked at construction and in slice()
        Ok(unsafe { base.add(self.offset) })
    }

    /// Raw pointer to the view; fails when nothing is allocated yet.
    pub fn ptr(&self) -> Result<*const u8, InferError> {
        let mem = self.memory()?;
        let base = mem
            .get()
            .ok_or_else(|| InferError::Memory("buffer not initialized".into()))?;
        Ok(unsafe { base.add(self.offset) as *const u8 })
    }

    /// Borrow host bytes. Fails for device memory.
    pub fn host_slice(&self) -> Result<&[u8], InferError> {
        if self.is_on_device() {
            return Err(InferError::InvalidParam("cannot borrow device memory".into()));
        }
        let p = self.ptr()?;
        Ok(unsafe { std::slice::from_raw_parts(p, self.size()) })
    }

    /// Mutably borrow host bytes, allocating on first call. Fails for
    /// device memory.
    pub fn host_slice_mut(&mut self) -> Result<&mut [u8], InferError> {
        if self.is_on_device() {
            return Err(InferError::InvalidParam("cannot borrow device memory".into()));
        }
        let size = self.size();
        let p = self.mutable_ptr()?;
        Ok(unsafe { std::slice::from_raw_parts_mut(p, size) })
    }

    /// Copy host bytes into this buffer (host→host or host→device).
    pub fn copy_from_slice(&mut self, src: &[u8]) -> Status {
        if self.size() < src.len() {
            return Err(InferError::InvalidParam("copy: dst smaller than copy size".into()));
        }
        let device = self.memory()?.device.clone();
        let dst = self.mutable_ptr()?;
        match device {
            None => unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) },
            Some(dev) => unsafe {
                dev.allocator().copy_to_device(dst, src.as_ptr(), src.len())?;
            },
        }
        Ok(())
    }

    /// Copy this buffer's bytes out to host memory.
    pub fn copy_to_slice(&self, dst: &mut [u8]) -> Status {
        if self.size() < dst.len() {
            return Err(InferError::InvalidParam("copy: src smaller than copy size".into()));
        }
        let src = self.ptr()?;
        match &self.memory()?.device {
            None => unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) },
            Some(dev) => unsafe {
                dev.allocator().copy_from_device(dst.as_mut_ptr(), src, dst.len())?;
            },
        }
        Ok(())
    }

    /// Copy `size` bytes from another buffer, in any direction pair.
    pub fn copy_from(&mut self, src: &Buffer, size: usize) -> Status {
        if src.size() < size {
            return Err(InferError::InvalidParam("copy: src smaller than copy size".into()));
        }
        if self.size() < size {
            return Err(InferError::InvalidParam("copy: dst smaller than copy size".into()));
        }
        let src_dev = src.memory()?.device.clone();
        let dst_dev = self.memory()?.device.clone();
        let sp = src.ptr()?;
        let dp = self.mutable_ptr()?;
        unsafe {
            match (dst_dev, src_dev) {
                (None, None) => ptr::copy(sp, dp, size),
                (None, Some(dev)) => dev.allocator().copy_from_device(dp, sp, size)?,
                (Some(dev), None) => dev.allocator().copy_to_device(dp, sp, size)?,
                (Some(dev), Some(_)) => dev.allocator().copy_within_device(dp, sp, size)?,
            }
        }
        Ok(())
    }

    /// Copy `size` bytes into another buffer.
    pub fn copy_to(&self, dst: &mut Buffer, size: usize) -> Status {
        dst.copy_from(self, size)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("type", &self.memory_type())
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("allocated", &self.owns_memory())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn empty_size_rejected() {
        assert!(Buffer::on_host(0).is_err());
    }

    #[test]
    fn lazy_allocation() {
        let mut b = Buffer::on_host(64).unwrap();
        assert!(!b.owns_memory());
        assert!(b.ptr().is_err());
        b.mutable_ptr().unwrap();
        assert!(b.owns_memory());
    }

    #[test]
    fn host_copy_roundtrip() {
        let mut b = Buffer::on_host(16).unwrap();
        let src: Vec<u8> = (0..16).collect();
        b.copy_from_slice(&src).unwrap();
        let mut dst = vec![0u8; 16];
        b.copy_to_slice(&mut dst).unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn slice_shares_storage() {
        let mut b = Buffer::on_host(16).unwrap();
        b.copy_from_slice(&(0..16).collect::<Vec<u8>>()).unwrap();
        let view = b.slice(4).unwrap();
        assert_eq!(view.size(), 12);
        let mut got = vec![0u8; 12];
        view.copy_to_slice(&mut got).unwrap();
        assert_eq!(got, (4..16).collect::<Vec<u8>>());
    }

    #[test]
    fn slice_out_of_range() {
        let b = Buffer::on_host(8).unwrap();
        assert!(b.slice(8).is_err());
        let v = b.slice(4).unwrap();
        assert!(v.slice(4).is_err());
    }

    #[test]
    fn device_copy_roundtrip() {
        let dev = Device::system(0).unwrap();
        let mut d = Buffer::on_device(32, &dev).unwrap();
        assert_eq!(d.device_id(), 0);
        let src = vec![9u8; 32];
        d.copy_from_slice(&src).unwrap();
        let mut host = Buffer::on_host(32).unwrap();
        host.copy_from(&d, 32).unwrap();
        assert_eq!(host.host_slice().unwrap(), &src[..]);
    }

    #[test]
    fn adopted_deallocator_runs_once() {
        static FREED: AtomicUsize = AtomicUsize::new(0);
        let raw = SystemAllocator.alloc(8).unwrap();
        let b = Buffer::adopt_host(
            raw,
            8,
            Box::new(|p| {
                FREED.fetch_add(1, Ordering::SeqCst);
                unsafe { SystemAllocator.dealloc(p, 8) };
            }),
        )
        .unwrap();
        let clone = b.clone();
        let view = b.slice(2).unwrap();
        drop(b);
        drop(clone);
        assert_eq!(FREED.load(Ordering::SeqCst), 0);
        drop(view);
        assert_eq!(FREED.load(Ordering::SeqCst), 1);
    }
}
