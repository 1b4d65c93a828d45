use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;

use hexgraph_core::{HexError, Result, SharedAllocator};
use hexgraph_sdk_sys::{RpcMemApi, RPCMEM_DEFAULT_FLAGS, RPCMEM_HEAP_ID_SYSTEM};

/// Shared memory from the remote-memory heap, mappable by the NPU.
///
/// rpcmem only guarantees page alignment, so each allocation is padded by
/// `align` bytes and the aligned pointer is mapped back to the raw one.
pub struct RpcMemAllocator {
    api: Arc<RpcMemApi>,
    raw_ptrs: Mutex<HashMap<usize, usize>>,
}

impl RpcMemAllocator {
    pub fn load(lib: Arc<Library>) -> Result<Self> {
        let api = unsafe { RpcMemApi::load(lib) }
            .map_err(|e| HexError::Library(format!("rpcmem symbol resolution failed: {e}")))?;
        Ok(Self::from_api(Arc::new(api)))
    }

    pub fn from_api(api: Arc<RpcMemApi>) -> Self {
        Self {
            api,
            raw_ptrs: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying API, shared with `NpuSdk` for fd lookups.
    pub fn api(&self) -> Arc<RpcMemApi> {
        Arc::clone(&self.api)
    }
}

fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

impl SharedAllocator for RpcMemAllocator {
    fn name(&self) -> &str {
        "rpcmem"
    }

    fn alloc(&self, bytes: usize, align: usize) -> Result<NonNull<u8>> {
        let padded = bytes
            .checked_add(align)
            .filter(|&n| n <= i32::MAX as usize)
            .ok_or(HexError::PoolExhausted {
                requested: bytes,
                available: i32::MAX as usize,
            })?;
        let raw = unsafe {
            (self.api.alloc)(RPCMEM_HEAP_ID_SYSTEM, RPCMEM_DEFAULT_FLAGS, padded as i32)
        };
        if raw.is_null() {
            return Err(HexError::Resource(format!("rpcmem_alloc of {padded} bytes failed")));
        }
        let aligned = align_up(raw as usize, align);
        self.raw_ptrs.lock().insert(aligned, raw as usize);
        NonNull::new(aligned as *mut u8)
            .ok_or_else(|| HexError::Resource("rpcmem returned null".into()))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _bytes: usize, _align: usize) {
        match self.raw_ptrs.lock().remove(&(ptr.as_ptr() as usize)) {
            Some(raw) => (self.api.free)(raw as *mut c_void),
            None => tracing::warn!(ptr = ?ptr, "free of unknown rpcmem pointer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0x1001, 0x100), 0x1100);
        assert_eq!(align_up(0x1000, 0x100), 0x1000);
    }
}
