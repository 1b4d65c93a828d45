use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use hexgraph_core::{HexError, Result, SharedAllocator};

static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Alignment for shared buffers (one accelerator cache line).
pub const SHARED_BUFFER_ALIGN: usize = 128;

pub(crate) fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Shared memory from the global allocator. Used where no vendor allocator
/// exists (coprocessor paths, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl SharedAllocator for HostAllocator {
    fn name(&self) -> &str {
        "host"
    }

    fn alloc(&self, bytes: usize, align: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes.max(1), align)
            .map_err(|e| HexError::InvalidInput(format!("bad shared buffer layout: {e}")))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| HexError::Resource(format!("host alloc of {bytes} bytes failed")))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        let layout = Layout::from_size_align_unchecked(bytes.max(1), align);
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Handle to one live pool allocation. Copying the handle does not copy
/// the memory; the pool stays the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedBuffer {
    id: u64,
    pool: u64,
    addr: usize,
    len: usize,
}

impl SharedBuffer {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Allocation {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
}

// Allocations are only touched under the pool lock.
unsafe impl Send for Allocation {}

#[derive(Default)]
struct PoolState {
    live: HashMap<u64, Allocation>,
    used: usize,
    next_id: u64,
}

/// Capacity-bounded pool of accelerator-mappable host memory.
///
/// The capacity is a soft budget over live allocations: a request that
/// would exceed it fails with `PoolExhausted` instead of reaching the
/// allocator.
pub struct SharedMemoryPool {
    id: u64,
    allocator: Arc<dyn SharedAllocator>,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl SharedMemoryPool {
    pub fn new(allocator: Arc<dyn SharedAllocator>, capacity: usize) -> Self {
        let id = POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pool = id, allocator = allocator.name(), capacity, "created shared memory pool");
        Self {
            id,
            allocator,
            capacity,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn alloc(&self, bytes: usize, align: usize) -> Result<SharedBuffer> {
        if !align.is_power_of_two() {
            return Err(HexError::InvalidInput(format!("alignment {align} is not a power of two")));
        }
        let size = align_up(bytes.max(1), align);
        let mut state = self.state.lock();
        let available = self.capacity.saturating_sub(state.used);
        if size > available {
            tracing::warn!(pool = self.id, requested = size, available, "shared memory pool exhausted");
            return Err(HexError::PoolExhausted {
                requested: size,
                available,
            });
        }
        let ptr = self.allocator.alloc(size, align)?;
        state.next_id += 1;
        let id = state.next_id;
        state.live.insert(id, Allocation { ptr, size, align });
        state.used += size;
        Ok(SharedBuffer {
            id,
            pool: self.id,
            addr: ptr.as_ptr() as usize,
            len: bytes,
        })
    }

    pub fn free(&self, buf: SharedBuffer) -> Result<()> {
        let alloc = {
            let mut state = self.state.lock();
            let alloc = self.take(&mut state, &buf)?;
            state.used -= alloc.size;
            alloc
        };
        unsafe { self.allocator.free(alloc.ptr, alloc.size, alloc.align) };
        Ok(())
    }

    /// Free every live buffer. Returns how many were released.
    pub fn free_all(&self) -> usize {
        let drained: Vec<Allocation> = {
            let mut state = self.state.lock();
            state.used = 0;
            state.live.drain().map(|(_, a)| a).collect()
        };
        for alloc in &drained {
            unsafe { self.allocator.free(alloc.ptr, alloc.size, alloc.align) };
        }
        drained.len()
    }

    /// Copy `src` to the start of `buf`.
    pub fn write(&self, buf: &SharedBuffer, src: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let alloc = self.lookup(&state, buf)?;
        if src.len() > buf.len {
            return Err(HexError::InvalidInput(format!(
                "write of {} bytes into {}-byte shared buffer",
                src.len(),
                buf.len
            )));
        }
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), alloc.ptr.as_ptr(), src.len()) };
        Ok(())
    }

    /// Copy the start of `buf` into `dst`.
    pub fn read(&self, buf: &SharedBuffer, dst: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let alloc = self.lookup(&state, buf)?;
        if dst.len() > buf.len {
            return Err(HexError::InvalidInput(format!(
                "read of {} bytes from {}-byte shared buffer",
                dst.len(),
                buf.len
            )));
        }
        unsafe { std::ptr::copy_nonoverlapping(alloc.ptr.as_ptr(), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn lookup<'s>(&self, state: &'s PoolState, buf: &SharedBuffer) -> Result<&'s Allocation> {
        if buf.pool != self.id {
            return Err(HexError::InvalidInput("shared buffer belongs to another pool".into()));
        }
        state
            .live
            .get(&buf.id)
            .ok_or_else(|| HexError::InvalidInput("shared buffer already freed".into()))
    }

    fn take(&self, state: &mut PoolState, buf: &SharedBuffer) -> Result<Allocation> {
        self.lookup(state, buf)?;
        state
            .live
            .remove(&buf.id)
            .ok_or_else(|| HexError::InvalidInput("shared buffer already freed".into()))
    }
}

impl Drop for SharedMemoryPool {
    fn drop(&mut self) {
        let freed = self.free_all();
        if freed > 0 {
            tracing::debug!(pool = self.id, freed, "released shared buffers on drop");
        }
    }
}
