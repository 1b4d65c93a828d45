use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use hexgraph_core::{Accelerator, ContextId, ContextParams, HexError, MemHandle, Result, SharedAllocator, TensorDesc};

use crate::memory::{SharedBuffer, SharedMemoryPool};
use crate::registry::SdkLibraries;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Live(ContextId),
    Finalized,
}

/// Owns the accelerator context, the shared-memory pool and the table of
/// registered memory, plus the library reference and device claim taken
/// when the backend was opened.
///
/// Not internally synchronized: the backend keeps it behind its engine lock.
pub struct ResourceManager {
    accel: Arc<dyn Accelerator>,
    registry: Arc<SdkLibraries>,
    libraries: Vec<PathBuf>,
    params: ContextParams,
    pool: SharedMemoryPool,
    registered: HashMap<MemHandle, usize>,
    by_addr: HashMap<usize, MemHandle>,
    lifecycle: Lifecycle,
}

impl ResourceManager {
    /// `libraries` are paths already acquired from `registry`; the manager
    /// releases them on finalize.
    pub fn new(
        accel: Arc<dyn Accelerator>,
        allocator: Arc<dyn SharedAllocator>,
        registry: Arc<SdkLibraries>,
        libraries: Vec<PathBuf>,
        params: ContextParams,
        pool_capacity: usize,
    ) -> Self {
        Self {
            accel,
            registry,
            libraries,
            params,
            pool: SharedMemoryPool::new(allocator, pool_capacity),
            registered: HashMap::new(),
            by_addr: HashMap::new(),
            lifecycle: Lifecycle::Created,
        }
    }

    /// Claim the device id and create its execution context.
    pub fn init(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Live(_) => {
                return Err(HexError::AlreadyInitialized {
                    device: self.params.device,
                })
            }
            Lifecycle::Finalized => return Err(HexError::Resource("resource manager already finalized".into())),
        }
        self.registry.claim_device(self.params.device)?;
        match self.accel.create_context(&self.params) {
            Ok(ctx) => {
                self.lifecycle = Lifecycle::Live(ctx);
                tracing::info!(
                    backend = self.accel.name(),
                    device = self.params.device,
                    profile = ?self.params.profile,
                    "accelerator context created"
                );
                Ok(())
            }
            Err(e) => {
                self.registry.release_device(self.params.device);
                Err(e)
            }
        }
    }

    pub fn context(&self) -> Result<ContextId> {
        match self.lifecycle {
            Lifecycle::Live(ctx) => Ok(ctx),
            _ => Err(HexError::NotInitialized),
        }
    }

    pub fn pool(&self) -> &SharedMemoryPool {
        &self.pool
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn alloc_shared(&mut self, bytes: usize, align: usize) -> Result<SharedBuffer> {
        self.context()?;
        self.pool.alloc(bytes, align)
    }

    /// Free a shared buffer, deregistering it first if needed.
    pub fn free_shared(&mut self, buf: SharedBuffer) -> Result<()> {
        if let Some(handle) = self.by_addr.get(&buf.addr()).copied() {
            self.unregister(handle)?;
        }
        self.pool.free(buf)
    }

    /// Register a shared buffer for zero-copy access as `desc`.
    pub fn register(&mut self, buf: &SharedBuffer, desc: &TensorDesc) -> Result<MemHandle> {
        let ctx = self.context()?;
        if let Some(handle) = self.by_addr.get(&buf.addr()) {
            return Ok(*handle);
        }
        let handle = self.accel.register_memory(ctx, buf.addr(), buf.len(), desc)?;
        self.registered.insert(handle, buf.addr());
        self.by_addr.insert(buf.addr(), handle);
        Ok(handle)
    }

    pub fn unregister(&mut self, handle: MemHandle) -> Result<()> {
        let addr = self
            .registered
            .remove(&handle)
            .ok_or_else(|| HexError::InvalidInput(format!("unknown memory handle {handle:?}")))?;
        self.by_addr.remove(&addr);
        self.accel.deregister_memory(handle)
    }

    pub fn handle_for(&self, addr: usize) -> Option<MemHandle> {
        self.by_addr.get(&addr).copied()
    }

    /// Deregister everything, keeping the first failure.
    fn unregister_all(&mut self) -> Result<()> {
        let mut first_err = None;
        let handles: Vec<MemHandle> = self.registered.keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.unregister(handle) {
                tracing::warn!(?handle, error = %e, "deregister failed during teardown");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Destroy and re-create the accelerator context. Registrations belong
    /// to the old context and are dropped; pool buffers survive.
    pub fn reset_context(&mut self) -> Result<()> {
        let old = self.context()?;
        self.unregister_all()?;
        self.accel.destroy_context(old)?;
        self.lifecycle = Lifecycle::Created;
        self.registry.release_device(self.params.device);
        self.init()?;
        tracing::info!(device = self.params.device, "accelerator context reset");
        Ok(())
    }

    /// Release every resource. Safe to call repeatedly; later calls are
    /// no-ops.
    pub fn finalize(&mut self) -> Result<()> {
        let ctx = match self.lifecycle {
            Lifecycle::Finalized => return Ok(()),
            Lifecycle::Created => None,
            Lifecycle::Live(ctx) => Some(ctx),
        };
        self.lifecycle = Lifecycle::Finalized;

        let mut result = self.unregister_all();
        let freed = self.pool.free_all();
        if let Some(ctx) = ctx {
            if let Err(e) = self.accel.destroy_context(ctx) {
                tracing::warn!(error = %e, "context destroy failed during teardown");
                result = result.and(Err(e));
            }
            self.registry.release_device(self.params.device);
        }
        for path in self.libraries.drain(..) {
            self.registry.release(&path);
        }
        tracing::info!(device = self.params.device, freed, "resources finalized");
        result
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::error!(error = %e, "resource teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HostAllocator, SHARED_BUFFER_ALIGN};
    use hexgraph_core::{AccelDType, PerfProfile, TensorRole};
    use hexgraph_dsp::Coprocessor;

    fn manager(registry: Arc<SdkLibraries>, device: u32) -> ResourceManager {
        ResourceManager::new(
            Arc::new(Coprocessor::host()),
            Arc::new(HostAllocator),
            registry,
            Vec::new(),
            ContextParams {
                device,
                profile: PerfProfile::Balanced,
                thread_count: 1,
                vtcm_mb: 0,
            },
            1 << 20,
        )
    }

    fn desc(n: u32) -> TensorDesc {
        TensorDesc::new("buf", TensorRole::AppWrite, AccelDType::Float32, vec![n])
    }

    #[test]
    fn test_second_context_for_device_rejected() {
        let registry = Arc::new(SdkLibraries::new());
        let mut a = manager(Arc::clone(&registry), 4);
        let mut b = manager(Arc::clone(&registry), 4);
        a.init().unwrap();
        assert!(matches!(a.init(), Err(HexError::AlreadyInitialized { device: 4 })));
        assert!(matches!(b.init(), Err(HexError::AlreadyInitialized { device: 4 })));
        a.finalize().unwrap();
        b.init().unwrap();
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let registry = Arc::new(SdkLibraries::new());
        let mut rm = manager(Arc::clone(&registry), 4);
        rm.init().unwrap();
        let buf = rm.alloc_shared(64, SHARED_BUFFER_ALIGN).unwrap();
        rm.register(&buf, &desc(16)).unwrap();
        rm.alloc_shared(32, SHARED_BUFFER_ALIGN).unwrap();

        rm.finalize().unwrap();
        assert_eq!(rm.registered_count(), 0);
        assert_eq!(rm.pool().live_buffers(), 0);
        assert!(!registry.is_device_live(4));

        rm.finalize().unwrap();
        assert!(matches!(rm.context(), Err(HexError::NotInitialized)));
    }

    #[test]
    fn test_register_is_bidirectional() {
        let mut rm = manager(Arc::new(SdkLibraries::new()), 4);
        rm.init().unwrap();
        let buf = rm.alloc_shared(64, SHARED_BUFFER_ALIGN).unwrap();
        let handle = rm.register(&buf, &desc(16)).unwrap();
        assert_eq!(rm.handle_for(buf.addr()), Some(handle));
        assert_eq!(rm.register(&buf, &desc(16)).unwrap(), handle);
        assert_eq!(rm.registered_count(), 1);

        rm.free_shared(buf).unwrap();
        assert_eq!(rm.handle_for(buf.addr()), None);
        assert_eq!(rm.registered_count(), 0);
    }

    #[test]
    fn test_reset_context_drops_registrations() {
        let mut rm = manager(Arc::new(SdkLibraries::new()), 4);
        rm.init().unwrap();
        let old = rm.context().unwrap();
        let buf = rm.alloc_shared(64, SHARED_BUFFER_ALIGN).unwrap();
        rm.register(&buf, &desc(16)).unwrap();

        rm.reset_context().unwrap();
        assert_ne!(rm.context().unwrap(), old);
        assert_eq!(rm.registered_count(), 0);
        assert_eq!(rm.pool().live_buffers(), 1);
    }
}
