//! Bounded free-list of fixed-size device buffers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::domain::{Buffer, Device};
use crate::error::InferError;

struct PoolState {
    free: Vec<*mut u8>,
    created: usize,
    running: bool,
}

// raw pointers in the free list originate from the pool's own device
// allocator and are only handed out wrapped in Buffers
unsafe impl Send for PoolState {}

struct PoolShared {
    buffer_size: usize,
    capacity: usize,
    device: Device,
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Recycling pool of same-sized device buffers.
///
/// Buffers are created lazily up to `capacity`. A handed-out buffer
/// returns to the free list (not the allocator) when its last handle
/// drops. Dropping the pool blocks until every outstanding buffer has
/// returned, then releases the memory.
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    pub fn new(buffer_size: usize, capacity: usize, device: &Device) -> Result<Self, InferError> {
        if buffer_size == 0 || capacity == 0 {
            return Err(InferError::InvalidParam(
                "memory pool needs non-zero buffer size and capacity".into(),
            ));
        }
        debug!(
            "init memory pool: {capacity} x {buffer_size} bytes on device {}",
            device.id()
        );
        Ok(Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                capacity,
                device: device.clone(),
                state: Mutex::new(PoolState { free: Vec::new(), created: 0, running: true }),
                cond: Condvar::new(),
            }),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Buffers created so far (free plus outstanding).
    pub fn created(&self) -> usize {
        self.shared.state.lock().created
    }

    /// Buffers currently sitting in the free list.
    pub fn cached(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    /// Refuse further acquisition; waiters fail with `Unavailable`.
    pub fn stop(&self) {
        self.shared.state.lock().running = false;
        self.shared.cond.notify_all();
    }

    /// Take a buffer, waiting up to `timeout` for one to free up.
    /// `None` waits endlessly.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<Buffer, InferError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.running {
            return Err(InferError::Unavailable("memory pool is stopped".into()));
        }

        if state.free.is_empty() && state.created < shared.capacity {
            let ptr = shared.device.allocator().alloc(shared.buffer_size)?;
            trace!("memory pool grows to {} buffers", state.created + 1);
            state.free.push(ptr);
            state.created += 1;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while state.free.is_empty() && state.running {
            match deadline {
                None => shared.cond.wait(&mut state),
                Some(dl) => {
                    if shared.cond.wait_until(&mut state, dl).timed_out() {
                        break;
                    }
                }
            }
        }
        if !state.running {
            return Err(InferError::Unavailable("memory pool is stopped".into()));
        }
        let Some(ptr) = state.free.pop() else {
            return Err(InferError::Timeout(
                "memory pool exhausted; release buffers sooner, raise capacity, or raise the timeout"
                    .into(),
            ));
        };
        drop(state);

        let ret = Arc::clone(shared);
        Buffer::adopt_device(
            ptr,
            shared.buffer_size,
            &shared.device,
            Box::new(move |p| {
                ret.state.lock().free.push(p);
                ret.cond.notify_all();
            }),
        )
    }
}

impl Drop for MemoryPool {
    // waits for every outstanding buffer, then frees the cache
    fn drop(&mut self) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.running = false;
        shared.cond.notify_all();
        while state.free.len() < state.created {
            trace!("memory pool waits for outstanding buffers");
            shared.cond.wait(&mut state);
        }
        for ptr in state.free.drain(..) {
            unsafe { shared.device.allocator().dealloc(ptr, shared.buffer_size) };
        }
        state.created = 0;
        debug!("memory pool destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn pool(cap: usize) -> MemoryPool {
        MemoryPool::new(256, cap, &Device::system(0).unwrap()).unwrap()
    }

    #[test]
    fn lazy_creation_up_to_capacity() {
        let p = pool(2);
        assert_eq!(p.created(), 0);
        let a = p.acquire(None).unwrap();
        assert_eq!(p.created(), 1);
        let b = p.acquire(None).unwrap();
        assert_eq!(p.created(), 2);
        drop(a);
        drop(b);
        assert_eq!(p.cached(), 2);
    }

    #[test]
    fn conservation() {
        let p = pool(3);
        let held: Vec<Buffer> = (0..3).map(|_| p.acquire(None).unwrap()).collect();
        assert_eq!(p.created(), 3);
        assert_eq!(p.cached(), 0);
        drop(held);
        assert_eq!(p.cached(), 3);
        assert!(p.created() <= p.capacity());
    }

    #[test]
    fn exhausted_acquire_times_out() {
        let p = pool(1);
        let _held = p.acquire(None).unwrap();
        let start = Instant::now();
        let r = p.acquire(Some(Duration::from_millis(30)));
        assert!(matches!(r, Err(InferError::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn release_wakes_waiter() {
        let p = Arc::new(pool(1));
        let held = p.acquire(None).unwrap();
        let p2 = Arc::clone(&p);
        let waiter = thread::spawn(move || p2.acquire(Some(Duration::from_secs(5))).is_ok());
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn acquire_after_stop_fails() {
        let p = pool(1);
        p.stop();
        assert!(matches!(p.acquire(None), Err(InferError::Unavailable(_))));
    }

    #[test]
    fn recycled_buffer_keeps_contents_region() {
        let p = pool(1);
        let mut a = p.acquire(None).unwrap();
        a.copy_from_slice(&[1, 2, 3]).unwrap();
        drop(a);
        let b = p.acquire(None).unwrap();
        assert_eq!(b.size(), 256);
    }
}
