use std::ptr::NonNull;

use crate::accel::{ContextId, ContextParams, GraphId, MemHandle, OpNode, TensorBinding, TensorDesc, TensorId};
use crate::error::Result;

/// Capability interface of an accelerator SDK.
///
/// One implementation exists per accelerator family (the vendor NPU SDK and
/// the direct coprocessor path); tests substitute their own. Every call is
/// blocking. Non-success codes surface as [`crate::HexError::Accelerator`].
pub trait Accelerator: Send + Sync {
    /// Human-readable name for tracing.
    fn name(&self) -> &str;

    fn create_context(&self, params: &ContextParams) -> Result<ContextId>;

    fn destroy_context(&self, ctx: ContextId) -> Result<()>;

    fn create_graph(&self, ctx: ContextId, name: &str) -> Result<GraphId>;

    fn create_tensor(&self, graph: GraphId, desc: &TensorDesc) -> Result<TensorId>;

    fn add_node(&self, graph: GraphId, node: &OpNode) -> Result<()>;

    /// No nodes may be added after this returns.
    fn finalize_graph(&self, graph: GraphId) -> Result<()>;

    /// Run a finalized graph.
    ///
    /// # Safety
    /// Every binding's buffer must be valid for `len` bytes for the duration
    /// of the call; output buffers must be writable and must not overlap any
    /// other binding.
    unsafe fn execute_graph(
        &self,
        graph: GraphId,
        inputs: &[TensorBinding],
        outputs: &[TensorBinding],
    ) -> Result<()>;

    /// Release a graph and every tensor created in it.
    fn destroy_graph(&self, graph: GraphId) -> Result<()>;

    /// Register `len` bytes at `addr` for zero-copy access as `desc`.
    fn register_memory(&self, ctx: ContextId, addr: usize, len: usize, desc: &TensorDesc) -> Result<MemHandle>;

    fn deregister_memory(&self, handle: MemHandle) -> Result<()>;
}

/// Source of host memory that an accelerator can map.
pub trait SharedAllocator: Send + Sync {
    fn name(&self) -> &str;

    fn alloc(&self, bytes: usize, align: usize) -> Result<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from `alloc` on this allocator with the same
    /// `bytes` and `align`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize, align: usize);
}
