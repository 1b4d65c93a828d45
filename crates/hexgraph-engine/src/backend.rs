use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use hexgraph_core::{
    AccelDType, Accelerator, BlockDequantizer, BufferBinding, DType, Dequantizer, HexError, OpDispatch, OpKind,
    Result, SharedAllocator, TensorBinding, TensorMeta,
};
use hexgraph_dsp::{Coprocessor, RemoteKernels};
use hexgraph_sdk::{NpuSdk, RpcMemAllocator};

use crate::adapter::stage_input;
use crate::cache::{CacheStats, GraphCache, GraphKey};
use crate::config::BackendConfig;
use crate::device::{DeviceInfo, DeviceKind, RPCMEM_LIBRARY};
use crate::graph::{build_graph, CachedGraph, SharedSlot, Template};
use crate::memory::{HostAllocator, SHARED_BUFFER_ALIGN};
use crate::ops::{self, OpCapability};
use crate::registry::{load_library, SdkLibraries};
use crate::resource::ResourceManager;

/// Per-backend dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Ops executed on the accelerator.
    pub computed: u64,
    /// Ops rejected by admission before any accelerator call.
    pub declined: u64,
    /// Ops that failed after admission.
    pub failed: u64,
    /// Time spent building graphs on cache misses.
    pub build_micros: u64,
    /// Time spent in bind, execute and read-back.
    pub execute_micros: u64,
}

struct Engine {
    cache: GraphCache,
    resources: ResourceManager,
    stats: DispatchStats,
}

/// The graph-offload engine for one device.
///
/// Every dispatch runs under one engine lock covering the graph cache and
/// the resource tables, so concurrent callers are serialized from lookup
/// through execute.
pub struct OffloadBackend {
    config: BackendConfig,
    device: &'static DeviceInfo,
    accel: Arc<dyn Accelerator>,
    dequantizer: Arc<dyn Dequantizer>,
    rpc_path: bool,
    engine: Mutex<Engine>,
}

type LoadedAccelerator = (Arc<dyn Accelerator>, Arc<dyn SharedAllocator>);

fn load_accelerator(
    config: &BackendConfig,
    registry: &SdkLibraries,
    acquired: &mut Vec<PathBuf>,
) -> Result<LoadedAccelerator> {
    let kind = config.device;
    let host_allocator: Arc<dyn SharedAllocator> = Arc::new(HostAllocator);
    if kind == DeviceKind::Host {
        let accel: Arc<dyn Accelerator> = Arc::new(Coprocessor::host());
        return Ok((accel, host_allocator));
    }
    let path = config
        .library()
        .ok_or_else(|| HexError::InvalidConfig(format!("no library configured for {kind}")))?;
    let lib = registry.acquire_with(&path, load_library)?;
    acquired.push(path);

    if kind == DeviceKind::Dsp {
        let kernels = RemoteKernels::from_library(lib)?;
        let accel: Arc<dyn Accelerator> = Arc::new(Coprocessor::new(kind.info().name, kernels));
        return Ok((accel, host_allocator));
    }

    if config.rpc_path_active() {
        let rpc_path = PathBuf::from(RPCMEM_LIBRARY);
        let rpc_lib = registry.acquire_with(&rpc_path, load_library)?;
        acquired.push(rpc_path);
        let allocator = RpcMemAllocator::load(rpc_lib)?;
        let accel: Arc<dyn Accelerator> = Arc::new(NpuSdk::new(kind.info().name, lib, Some(allocator.api()))?);
        let allocator: Arc<dyn SharedAllocator> = Arc::new(allocator);
        return Ok((accel, allocator));
    }
    let accel: Arc<dyn Accelerator> = Arc::new(NpuSdk::new(kind.info().name, lib, None)?);
    Ok((accel, host_allocator))
}

impl OffloadBackend {
    /// Load the configured device's library through `registry` and bring up
    /// its execution context.
    pub fn open(config: BackendConfig, registry: Arc<SdkLibraries>) -> Result<Self> {
        config.validate()?;
        let mut acquired = Vec::new();
        let (accel, allocator) = match load_accelerator(&config, &registry, &mut acquired) {
            Ok(loaded) => loaded,
            Err(e) => {
                for path in &acquired {
                    registry.release(path);
                }
                return Err(e);
            }
        };
        Self::assemble(config, accel, allocator, registry, acquired)
    }

    /// Bring up a backend over an already constructed accelerator.
    pub fn with_accelerator(
        config: BackendConfig,
        accel: Arc<dyn Accelerator>,
        allocator: Arc<dyn SharedAllocator>,
        registry: Arc<SdkLibraries>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, accel, allocator, registry, Vec::new())
    }

    fn assemble(
        config: BackendConfig,
        accel: Arc<dyn Accelerator>,
        allocator: Arc<dyn SharedAllocator>,
        registry: Arc<SdkLibraries>,
        libraries: Vec<PathBuf>,
    ) -> Result<Self> {
        let mut resources = ResourceManager::new(
            Arc::clone(&accel),
            allocator,
            registry,
            libraries,
            config.context_params(),
            config.pool_capacity_bytes(),
        );
        resources.init()?;

        let device = config.device.info();
        let rpc_path = config.rpc_path_active();
        tracing::info!(
            device = device.name,
            backend = accel.name(),
            rpc_path,
            cache_capacity = ?config.graph_cache_capacity,
            "offload backend ready"
        );
        Ok(Self {
            engine: Mutex::new(Engine {
                cache: GraphCache::new(config.graph_cache_capacity),
                resources,
                stats: DispatchStats::default(),
            }),
            config,
            device,
            accel,
            dequantizer: Arc::new(BlockDequantizer),
            rpc_path,
        })
    }

    /// Replace the numeric-kernel collaborator used to stage operands.
    pub fn with_dequantizer(mut self, dequantizer: Arc<dyn Dequantizer>) -> Self {
        self.dequantizer = dequantizer;
        self
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn device(&self) -> &'static DeviceInfo {
        self.device
    }

    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accel
    }

    pub fn rpc_path(&self) -> bool {
        self.rpc_path
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.engine.lock().cache.stats()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.engine.lock().stats
    }

    pub fn registered_memory(&self) -> usize {
        self.engine.lock().resources.registered_count()
    }

    pub fn live_shared_buffers(&self) -> usize {
        self.engine.lock().resources.pool().live_buffers()
    }

    /// Whether `dispatch` would be offloaded. Never calls the accelerator.
    pub fn supports_op(&self, dispatch: &OpDispatch<'_>) -> bool {
        let srcs: Vec<TensorMeta> = dispatch.srcs.iter().map(|v| v.meta()).collect();
        self.check_op(dispatch.op, &srcs, &dispatch.dst.meta()).is_ok()
    }

    /// Admission check: the table row for `op`, or why it cannot be
    /// offloaded.
    pub fn check_op(&self, op: OpKind, srcs: &[TensorMeta], dst: &TensorMeta) -> Result<&'static OpCapability> {
        let cap = ops::lookup(op)?;
        if srcs.len() != cap.input_count {
            return Err(HexError::InvalidInput(format!(
                "{op} takes {} sources, got {}",
                cap.input_count,
                srcs.len()
            )));
        }
        for meta in srcs.iter().chain(std::iter::once(dst)) {
            let rank = meta.shape.rank();
            if rank == 0 || rank > hexgraph_core::MAX_DIMS {
                return Err(HexError::Unsupported(format!("{op}: rank {rank}")));
            }
            if !meta.is_contiguous() {
                return Err(HexError::Unsupported(format!("{op}: non-contiguous tensor")));
            }
        }
        if dst.dtype != self.device.native {
            return Err(HexError::Unsupported(format!(
                "{op}: destination {} is not {}",
                dst.dtype, self.device.native
            )));
        }
        if dst.shape.elements() < self.config.min_offload_elements {
            return Err(HexError::Unsupported(format!(
                "{op}: {} elements below offload threshold {}",
                dst.shape.elements(),
                self.config.min_offload_elements
            )));
        }
        match op {
            OpKind::MulMat => self.check_matmul(srcs, dst)?,
            _ => self.check_elementwise(op, srcs, dst)?,
        }
        Ok(cap)
    }

    fn check_elementwise(&self, op: OpKind, srcs: &[TensorMeta], dst: &TensorMeta) -> Result<()> {
        for src in srcs {
            if !self.device.accepts(src.dtype) || AccelDType::from_host(src.dtype).is_none() {
                return Err(HexError::Unsupported(format!(
                    "{op}: {} sources not accepted by {}",
                    src.dtype, self.device.name
                )));
            }
        }
        let mismatch = || {
            let shapes: Vec<String> = srcs.iter().map(|s| s.shape.to_string()).collect();
            HexError::Unsupported(format!(
                "{op}: sources {} do not broadcast to {}",
                shapes.join(", "),
                dst.shape
            ))
        };
        let src_rank = srcs.iter().map(|s| s.shape.rank()).max().unwrap_or(0);
        if src_rank != dst.shape.rank() {
            return Err(mismatch());
        }
        // Per axis, the sources must agree up to extent 1 and their
        // broadcast must be exactly the destination extent.
        let ne = dst.shape.ne();
        for (axis, &d) in ne.iter().enumerate() {
            let extent = srcs.iter().map(|s| s.shape.ne()[axis]).max().unwrap_or(1);
            if extent != d || srcs.iter().any(|s| ![1, d].contains(&s.shape.ne()[axis])) {
                return Err(mismatch());
            }
        }
        Ok(())
    }

    fn check_matmul(&self, srcs: &[TensorMeta], dst: &TensorMeta) -> Result<()> {
        let (a, b) = (&srcs[0], &srcs[1]);
        let rank = dst.shape.rank();
        if rank < 2 || a.shape.rank() != rank || b.shape.rank() != rank {
            return Err(HexError::Unsupported(format!(
                "MUL_MAT: ranks {}/{}/{rank} must match and be at least 2",
                a.shape.rank(),
                b.shape.rank()
            )));
        }
        for src in [a, b] {
            let direct = src.dtype == DType::F32;
            let stageable = self.dequantizer.supports(src.dtype) && src.shape.ne()[0] % src.dtype.block_size() == 0;
            if !direct && !stageable {
                return Err(HexError::Unsupported(format!("MUL_MAT: cannot stage {} operand", src.dtype)));
            }
        }
        let [k, m, a2, a3] = a.shape.ne();
        let [kb, n, b2, b3] = b.shape.ne();
        if k != kb {
            return Err(HexError::Unsupported(format!("MUL_MAT: inner dimensions {k} and {kb} differ")));
        }
        if dst.shape.ne() != [m, n, b2, b3] {
            return Err(HexError::Unsupported(format!(
                "MUL_MAT: destination {} does not match {}x{}",
                dst.shape, a.shape, b.shape
            )));
        }
        if (b2 * b3) % (a2 * a3) != 0 {
            return Err(HexError::Unsupported(format!(
                "MUL_MAT: batch {} does not divide {}",
                a2 * a3,
                b2 * b3
            )));
        }
        Ok(())
    }

    /// Run one op on the accelerator, writing the result into `dispatch.dst`.
    pub fn compute(&self, dispatch: &mut OpDispatch<'_>) -> Result<()> {
        let op = dispatch.op;
        let srcs: Vec<TensorMeta> = dispatch.srcs.iter().map(|v| v.meta()).collect();
        let dst = dispatch.dst.meta();
        let cap = match self.check_op(op, &srcs, &dst) {
            Ok(cap) => cap,
            Err(e) => {
                self.engine.lock().stats.declined += 1;
                return Err(e);
            }
        };
        let template = Template::select(op, &srcs, &dst);
        let key = GraphKey::new(op, template, &srcs, &dst);

        let mut guard = self.engine.lock();
        let engine = &mut *guard;
        let ctx = engine.resources.context()?;

        if engine.cache.get(&key).is_none() {
            let started = Instant::now();
            let mut graph = match build_graph(self.accel.as_ref(), ctx, &key, cap, template, &srcs, &dst) {
                Ok(graph) => graph,
                Err(e) => {
                    engine.stats.failed += 1;
                    tracing::warn!(key = %key, error = %e, "graph build failed");
                    return Err(e);
                }
            };
            if self.rpc_path {
                if let Err(e) = attach_shared(&mut engine.resources, &mut graph) {
                    engine.stats.failed += 1;
                    let _ = self.release_graph(&mut engine.resources, &key, graph);
                    return Err(e);
                }
            }
            let micros = started.elapsed().as_micros() as u64;
            engine.stats.build_micros += micros;
            tracing::debug!(key = %key, micros, tensors = graph.tensors.len(), "graph built");
            if let Some((old_key, old)) = engine.cache.insert(key.clone(), graph) {
                let _ = self.release_graph(&mut engine.resources, &old_key, old);
            }
        }
        let graph = engine
            .cache
            .peek_mut(&key)
            .ok_or_else(|| HexError::Resource(format!("graph {key} missing after insert")))?;

        let staged = dispatch
            .srcs
            .iter()
            .zip(&graph.inputs)
            .map(|(view, port)| stage_input(view, &port.tensor, self.dequantizer.as_ref()))
            .collect::<Result<Vec<Cow<'_, [u8]>>>>()?;
        let out_len = graph.output.tensor.byte_len();

        let (inputs, outputs) = if graph.shared.is_empty() {
            let inputs = graph
                .inputs
                .iter()
                .zip(&staged)
                .map(|(port, bytes)| TensorBinding {
                    tensor: port.id,
                    buffer: BufferBinding::Client {
                        addr: bytes.as_ptr() as usize,
                        len: bytes.len(),
                    },
                })
                .collect::<Vec<_>>();
            let output = TensorBinding {
                tensor: graph.output.id,
                buffer: BufferBinding::Client {
                    addr: dispatch.dst.as_mut_ptr() as usize,
                    len: out_len,
                },
            };
            (inputs, vec![output])
        } else {
            let pool = engine.resources.pool();
            let mut inputs = Vec::with_capacity(graph.inputs.len());
            for ((port, slot), bytes) in graph.inputs.iter().zip(&graph.shared).zip(&staged) {
                pool.write(&slot.buffer, bytes)?;
                inputs.push(shared_binding(port.id, slot));
            }
            let out_slot = graph.shared[graph.inputs.len()];
            (inputs, vec![shared_binding(graph.output.id, &out_slot)])
        };

        tracing::trace!(key = %key, inputs = inputs.len(), rpc = !graph.shared.is_empty(), "executing graph");
        let started = Instant::now();
        // SAFETY: client bindings point into `staged` and `dispatch.dst`,
        // shared bindings into live pool buffers; all outlive the call and
        // the destination does not alias any source.
        let executed = unsafe { self.accel.execute_graph(graph.graph, &inputs, &outputs) };
        if let Err(e) = executed {
            engine.stats.failed += 1;
            tracing::warn!(key = %key, error = %e, "graph execute failed");
            return Err(e);
        }
        if let Some(out_slot) = graph.shared.last() {
            engine
                .resources
                .pool()
                .read(&out_slot.buffer, &mut dispatch.dst.data_mut()[..out_len])?;
        }
        let micros = started.elapsed().as_micros() as u64;
        graph.runs += 1;
        engine.stats.computed += 1;
        engine.stats.execute_micros += micros;
        tracing::debug!(key = %key, micros, runs = graph.runs, "op offloaded");
        Ok(())
    }

    /// [`compute`](Self::compute) with the host runtime's boolean
    /// convention: failures are logged, not returned.
    pub fn compute_logged(&self, dispatch: &mut OpDispatch<'_>) -> bool {
        match self.compute(dispatch) {
            Ok(()) => true,
            Err(e) if e.is_unsupported() => {
                tracing::debug!(op = %dispatch.op, reason = %e, "op not offloaded");
                false
            }
            Err(e) => {
                tracing::error!(op = %dispatch.op, error = %e, "offload failed");
                false
            }
        }
    }

    fn release_graph(&self, resources: &mut ResourceManager, key: &GraphKey, graph: CachedGraph) -> Result<()> {
        let mut result = Ok(());
        for slot in graph.shared {
            if let Err(e) = resources.free_shared(slot.buffer) {
                tracing::warn!(key = %key, error = %e, "failed to free shared buffer");
                result = result.and(Err(e));
            }
        }
        if let Err(e) = self.accel.destroy_graph(graph.graph) {
            tracing::warn!(key = %key, error = %e, "failed to destroy graph");
            result = result.and(Err(e));
        }
        result
    }

    fn release_all(&self, engine: &mut Engine) -> Result<()> {
        let mut result = Ok(());
        for (key, graph) in engine.cache.drain() {
            result = result.and(self.release_graph(&mut engine.resources, &key, graph));
        }
        result
    }

    /// Destroy every cached graph and re-create the accelerator context.
    pub fn reset_context(&self) -> Result<()> {
        let mut guard = self.engine.lock();
        let engine = &mut *guard;
        let dropped = engine.cache.len();
        self.release_all(engine)?;
        engine.resources.reset_context()?;
        tracing::info!(dropped, "graph cache invalidated by context reset");
        Ok(())
    }

    /// Tear down graphs, registrations, shared buffers, the context and the
    /// library reference. A second call is a no-op.
    pub fn finalize(&self) -> Result<()> {
        let mut guard = self.engine.lock();
        let engine = &mut *guard;
        let graphs = self.release_all(engine);
        let resources = engine.resources.finalize();
        graphs.and(resources)
    }
}

fn shared_binding(tensor: hexgraph_core::TensorId, slot: &SharedSlot) -> TensorBinding {
    TensorBinding {
        tensor,
        buffer: BufferBinding::Shared {
            mem: slot.mem,
            addr: slot.buffer.addr(),
            len: slot.buffer.len(),
        },
    }
}

/// Allocate and register one shared buffer per graph input and output.
fn attach_shared(resources: &mut ResourceManager, graph: &mut CachedGraph) -> Result<()> {
    let ports: Vec<_> = graph.inputs.iter().chain(std::iter::once(&graph.output)).collect();
    let mut slots = Vec::with_capacity(ports.len());
    let mut result = Ok(());
    for port in ports {
        let buffer = match resources.alloc_shared(port.tensor.byte_len(), SHARED_BUFFER_ALIGN) {
            Ok(buffer) => buffer,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        match resources.register(&buffer, &port.tensor.desc) {
            Ok(mem) => slots.push(SharedSlot { buffer, mem }),
            Err(e) => {
                let _ = resources.free_shared(buffer);
                result = Err(e);
                break;
            }
        }
    }
    // On failure the partial slots stay attached so the caller frees them.
    graph.shared = slots;
    result
}

impl Drop for OffloadBackend {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::error!(error = %e, "backend teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexgraph_core::{HostTensor, Shape};

    fn backend() -> OffloadBackend {
        OffloadBackend::open(BackendConfig::host(), Arc::new(SdkLibraries::new())).unwrap()
    }

    fn meta(dtype: DType, dims: &[usize]) -> TensorMeta {
        TensorMeta::contiguous(dtype, Shape::new(dims).unwrap())
    }

    #[test]
    fn test_check_op_matmul_rules() {
        let b = backend();
        let f = |d: &[usize]| meta(DType::F32, d);
        assert!(b.check_op(OpKind::MulMat, &[f(&[8, 4]), f(&[8, 3])], &f(&[4, 3])).is_ok());
        // Destination must be [M, N].
        assert!(b.check_op(OpKind::MulMat, &[f(&[8, 4]), f(&[8, 3])], &f(&[3, 4])).is_err());
        // Rank 1 matmul is not offloaded.
        assert!(b.check_op(OpKind::MulMat, &[f(&[8]), f(&[8])], &f(&[1])).is_err());
        // Q8_0 rows must be whole blocks.
        let q = meta(DType::Q8_0, &[64, 4]);
        assert!(b.check_op(OpKind::MulMat, &[q, f(&[64, 2])], &f(&[4, 2])).is_ok());
        assert!(b.check_op(OpKind::MulMat, &[f(&[8, 4]), f(&[8, 2])], &meta(DType::F16, &[4, 2])).is_err());
    }

    #[test]
    fn test_check_op_elementwise_rules() {
        let b = backend();
        let f = |d: &[usize]| meta(DType::F32, d);
        assert!(b.check_op(OpKind::Add, &[f(&[8, 4]), f(&[8, 1])], &f(&[8, 4])).is_ok());
        assert!(b.check_op(OpKind::Add, &[f(&[8, 4]), f(&[8, 2])], &f(&[8, 4])).is_err());
        // Both sources broadcast on their own, but together they only make [8, 1].
        let err = b.check_op(OpKind::Add, &[f(&[8, 1]), f(&[8, 1])], &f(&[8, 4])).unwrap_err();
        assert!(err.is_unsupported());
        // The destination may not add axes the sources lack.
        let err = b.check_op(OpKind::Add, &[f(&[8, 4]), f(&[8, 4])], &f(&[8, 4, 2])).unwrap_err();
        assert!(err.is_unsupported());
        assert!(b.check_op(OpKind::Add, &[f(&[8, 1]), f(&[1, 4])], &f(&[8, 4])).is_ok());
        // Unary ops do not broadcast.
        assert!(b.check_op(OpKind::Sqrt, &[f(&[8, 1])], &f(&[8, 4])).is_err());
        let err = b.check_op(OpKind::Add, &[f(&[8])], &f(&[8])).unwrap_err();
        assert!(matches!(err, HexError::InvalidInput(_)));
        assert!(b.check_op(OpKind::Rope, &[f(&[8])], &f(&[8])).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_compute_logged_reports_bool() {
        let b = backend();
        let a = HostTensor::from_f32(&[2], &[1.0, 2.0]).unwrap();
        let mut dst = HostTensor::zeros(DType::F32, &[2]).unwrap();
        {
            let mut d = OpDispatch::new(OpKind::Log, vec![a.view()], dst.view_mut());
            assert!(b.compute_logged(&mut d));
        }
        let out = dst.to_f32_vec().unwrap();
        assert!((out[1] - 2f32.ln()).abs() < 1e-6);
        {
            let mut d = OpDispatch::new(OpKind::SoftMax, vec![a.view()], dst.view_mut());
            assert!(!b.compute_logged(&mut d));
        }
        assert_eq!(b.dispatch_stats().declined, 1);
    }
}
