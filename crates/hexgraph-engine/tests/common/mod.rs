#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use hexgraph_core::{
    Accelerator, ApiStatus, BufferBinding, ContextId, ContextParams, GraphId, HexError, HostTensor, MemHandle, OpDispatch,
    OpKind, OpNode, Result, TensorBinding, TensorDesc, TensorId,
};
use hexgraph_dsp::{Coprocessor, HostKernels};
use hexgraph_engine::{BackendConfig, HostAllocator, OffloadBackend, SdkLibraries};

/// Call counters for [`Recording`].
#[derive(Debug, Default)]
pub struct Calls {
    pub create_context: AtomicUsize,
    pub destroy_context: AtomicUsize,
    pub create_graph: AtomicUsize,
    pub add_node: AtomicUsize,
    pub execute: AtomicUsize,
    pub destroy_graph: AtomicUsize,
    pub register: AtomicUsize,
    pub deregister: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        [
            &self.create_context,
            &self.destroy_context,
            &self.create_graph,
            &self.add_node,
            &self.execute,
            &self.destroy_graph,
            &self.register,
            &self.deregister,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// In-process coprocessor that counts every call and remembers the input
/// bindings of the last execute.
pub struct Recording {
    inner: Coprocessor<HostKernels>,
    pub calls: Calls,
    pub last_inputs: Mutex<Vec<BufferBinding>>,
    pub node_types: Mutex<Vec<String>>,
    /// When set, the next execute fails with a vendor error code.
    pub fail_next_execute: AtomicBool,
}

impl Recording {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Coprocessor::host(),
            calls: Calls::default(),
            last_inputs: Mutex::new(Vec::new()),
            node_types: Mutex::new(Vec::new()),
            fail_next_execute: AtomicBool::new(false),
        })
    }
}

impl Accelerator for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    fn create_context(&self, params: &ContextParams) -> Result<ContextId> {
        bump(&self.calls.create_context);
        self.inner.create_context(params)
    }

    fn destroy_context(&self, ctx: ContextId) -> Result<()> {
        bump(&self.calls.destroy_context);
        self.inner.destroy_context(ctx)
    }

    fn create_graph(&self, ctx: ContextId, name: &str) -> Result<GraphId> {
        bump(&self.calls.create_graph);
        self.inner.create_graph(ctx, name)
    }

    fn create_tensor(&self, graph: GraphId, desc: &TensorDesc) -> Result<TensorId> {
        self.inner.create_tensor(graph, desc)
    }

    fn add_node(&self, graph: GraphId, node: &OpNode) -> Result<()> {
        bump(&self.calls.add_node);
        self.node_types.lock().push(node.op_type.clone());
        self.inner.add_node(graph, node)
    }

    fn finalize_graph(&self, graph: GraphId) -> Result<()> {
        self.inner.finalize_graph(graph)
    }

    unsafe fn execute_graph(&self, graph: GraphId, inputs: &[TensorBinding], outputs: &[TensorBinding]) -> Result<()> {
        bump(&self.calls.execute);
        *self.last_inputs.lock() = inputs.iter().map(|b| b.buffer).collect();
        if self.fail_next_execute.swap(false, Ordering::SeqCst) {
            return Err(HexError::accelerator("graph_execute", ApiStatus::Failure(7)));
        }
        self.inner.execute_graph(graph, inputs, outputs)
    }

    fn destroy_graph(&self, graph: GraphId) -> Result<()> {
        bump(&self.calls.destroy_graph);
        self.inner.destroy_graph(graph)
    }

    fn register_memory(&self, ctx: ContextId, addr: usize, len: usize, desc: &TensorDesc) -> Result<MemHandle> {
        bump(&self.calls.register);
        self.inner.register_memory(ctx, addr, len, desc)
    }

    fn deregister_memory(&self, handle: MemHandle) -> Result<()> {
        bump(&self.calls.deregister);
        self.inner.deregister_memory(handle)
    }
}

pub fn open_with(config: BackendConfig, accel: Arc<Recording>) -> OffloadBackend {
    OffloadBackend::with_accelerator(
        config,
        accel,
        Arc::new(HostAllocator),
        Arc::new(SdkLibraries::new()),
    )
    .expect("backend should open over the recording accelerator")
}

pub fn host_backend() -> (OffloadBackend, Arc<Recording>) {
    let accel = Recording::new();
    (open_with(BackendConfig::host(), Arc::clone(&accel)), accel)
}

pub fn filled(dims: &[usize], value: f32) -> HostTensor {
    let n: usize = dims.iter().product();
    HostTensor::from_f32(dims, &vec![value; n]).unwrap()
}

pub fn random(dims: &[usize], seed: u64) -> HostTensor {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let n: usize = dims.iter().product();
    let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..=1.0)).collect();
    HostTensor::from_f32(dims, &values).unwrap()
}

/// Run `op` on the backend into a fresh F32 destination.
pub fn run(backend: &OffloadBackend, op: OpKind, srcs: &[&HostTensor], dst_dims: &[usize]) -> Result<Vec<f32>> {
    let mut dst = HostTensor::zeros(hexgraph_core::DType::F32, dst_dims)?;
    {
        let views = srcs.iter().map(|t| t.view()).collect();
        let mut dispatch = OpDispatch::new(op, views, dst.view_mut());
        backend.compute(&mut dispatch)?;
    }
    dst.to_f32_vec()
}

pub fn expect_unsupported(result: Result<Vec<f32>>) {
    match result {
        Err(e) if e.is_unsupported() => {}
        Err(HexError::InvalidInput(_)) => {}
        other => panic!("expected the op to be declined, got {other:?}"),
    }
}
