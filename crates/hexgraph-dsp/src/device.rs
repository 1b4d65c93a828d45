use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use hexgraph_core::{
    AccelDType, Accelerator, ApiStatus, BufferBinding, ContextId, ContextParams, GraphId, HexError,
    MemHandle, OpNode, Result, TensorBinding, TensorDesc, TensorId,
};

use crate::kernels::{HostKernels, KernelRuntime};
use crate::program::Program;

enum GraphSlot {
    Building(Program),
    Finalized(Arc<Program>),
}

struct GraphEntry {
    context: u64,
    slot: GraphSlot,
}

struct MemRecord {
    context: u64,
    addr: usize,
    len: usize,
}

#[derive(Default)]
struct DeviceState {
    next_id: u64,
    contexts: HashSet<u64>,
    graphs: HashMap<u64, GraphEntry>,
    mems: HashMap<u64, MemRecord>,
}

impl DeviceState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Capability interface that drives the coprocessor directly.
///
/// Graphs are interpreted on the host side and every node is dispatched to
/// the [`KernelRuntime`] as a single kernel. Only Float32 data tensors (and
/// static UInt32 parameter tensors) are accepted.
pub struct Coprocessor<R: KernelRuntime> {
    name: String,
    runtime: R,
    state: Mutex<DeviceState>,
}

impl Coprocessor<HostKernels> {
    /// Coprocessor interface that runs every kernel in-process.
    pub fn host() -> Self {
        Self::new("host", HostKernels)
    }
}

impl<R: KernelRuntime> Coprocessor<R> {
    pub fn new(name: impl Into<String>, runtime: R) -> Self {
        Self {
            name: name.into(),
            runtime,
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    fn finalized(&self, graph: GraphId) -> Result<Arc<Program>> {
        let state = self.state.lock();
        match state.graphs.get(&graph.0) {
            Some(GraphEntry {
                slot: GraphSlot::Finalized(program),
                ..
            }) => Ok(Arc::clone(program)),
            Some(_) => Err(HexError::accelerator("graph_execute", ApiStatus::InvalidState)),
            None => Err(HexError::accelerator("graph_execute", ApiStatus::InvalidHandle)),
        }
    }

    fn with_building<T>(&self, graph: GraphId, call: &'static str, f: impl FnOnce(&mut Program) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        match state.graphs.get_mut(&graph.0) {
            Some(GraphEntry {
                slot: GraphSlot::Building(program),
                ..
            }) => f(program),
            Some(_) => Err(HexError::accelerator(call, ApiStatus::InvalidState)),
            None => Err(HexError::accelerator(call, ApiStatus::InvalidHandle)),
        }
    }

    /// Check a binding against its tensor and, for shared buffers, the
    /// registered region.
    fn check_binding(&self, program: &Program, binding: &TensorBinding) -> Result<usize> {
        let desc = program.tensor(binding.tensor)?;
        let need = desc.nbytes();
        if binding.buffer.len() != need {
            return Err(HexError::InvalidInput(format!(
                "binding for {} is {} bytes, tensor needs {need}",
                desc.name,
                binding.buffer.len()
            )));
        }
        if let BufferBinding::Shared { mem, addr, len } = binding.buffer {
            let state = self.state.lock();
            let record = state
                .mems
                .get(&mem.0)
                .ok_or(HexError::accelerator("mem_lookup", ApiStatus::InvalidHandle))?;
            if addr < record.addr || addr + len > record.addr + record.len {
                return Err(HexError::InvalidInput(format!(
                    "binding for {} lies outside registered memory",
                    desc.name
                )));
            }
        }
        Ok(need)
    }
}

impl<R: KernelRuntime> Accelerator for Coprocessor<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_context(&self, params: &ContextParams) -> Result<ContextId> {
        self.runtime.open(params)?;
        let mut state = self.state.lock();
        let id = state.next();
        state.contexts.insert(id);
        tracing::debug!(backend = %self.name, runtime = self.runtime.name(), context = id, "opened coprocessor context");
        Ok(ContextId(id))
    }

    fn destroy_context(&self, ctx: ContextId) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.contexts.remove(&ctx.0) {
                return Err(HexError::accelerator("context_free", ApiStatus::InvalidHandle));
            }
            state.graphs.retain(|_, g| g.context != ctx.0);
            state.mems.retain(|_, m| m.context != ctx.0);
        }
        self.runtime.close()
    }

    fn create_graph(&self, ctx: ContextId, name: &str) -> Result<GraphId> {
        let mut state = self.state.lock();
        if !state.contexts.contains(&ctx.0) {
            return Err(HexError::accelerator("graph_create", ApiStatus::InvalidHandle));
        }
        let id = state.next();
        state.graphs.insert(
            id,
            GraphEntry {
                context: ctx.0,
                slot: GraphSlot::Building(Program::new(name)),
            },
        );
        tracing::trace!(graph = name, id, "created coprocessor graph");
        Ok(GraphId(id))
    }

    fn create_tensor(&self, graph: GraphId, desc: &TensorDesc) -> Result<TensorId> {
        self.with_building(graph, "create_tensor", |p| p.add_tensor(desc))
    }

    fn add_node(&self, graph: GraphId, node: &OpNode) -> Result<()> {
        self.with_building(graph, "graph_add_node", |p| p.add_node(node))
    }

    fn finalize_graph(&self, graph: GraphId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .graphs
            .get_mut(&graph.0)
            .ok_or(HexError::accelerator("graph_finalize", ApiStatus::InvalidHandle))?;
        let program = match std::mem::replace(&mut entry.slot, GraphSlot::Building(Program::new(""))) {
            GraphSlot::Building(program) => program,
            finalized @ GraphSlot::Finalized(_) => {
                entry.slot = finalized;
                return Err(HexError::accelerator("graph_finalize", ApiStatus::InvalidState));
            }
        };
        if let Err(e) = program.validate() {
            entry.slot = GraphSlot::Building(program);
            return Err(e);
        }
        tracing::debug!(graph = program.name(), nodes = program.node_count(), "finalized coprocessor graph");
        entry.slot = GraphSlot::Finalized(Arc::new(program));
        Ok(())
    }

    unsafe fn execute_graph(
        &self,
        graph: GraphId,
        inputs: &[TensorBinding],
        outputs: &[TensorBinding],
    ) -> Result<()> {
        let program = self.finalized(graph)?;

        let mut feeds = Vec::with_capacity(inputs.len());
        for binding in inputs {
            let len = self.check_binding(&program, binding)?;
            let bytes = std::slice::from_raw_parts(binding.buffer.addr() as *const u8, len);
            feeds.push((binding.tensor, bytemuck::pod_collect_to_vec::<u8, f32>(bytes)));
        }
        for binding in outputs {
            self.check_binding(&program, binding)?;
        }

        let fetch: Vec<TensorId> = outputs.iter().map(|b| b.tensor).collect();
        let results = program.run(&self.runtime, feeds, &fetch)?;

        for (binding, values) in outputs.iter().zip(results) {
            let dst = std::slice::from_raw_parts_mut(binding.buffer.addr() as *mut u8, binding.buffer.len());
            dst.copy_from_slice(bytemuck::cast_slice(&values));
        }
        Ok(())
    }

    fn destroy_graph(&self, graph: GraphId) -> Result<()> {
        self.state
            .lock()
            .graphs
            .remove(&graph.0)
            .map(|_| ())
            .ok_or(HexError::accelerator("graph_free", ApiStatus::InvalidHandle))
    }

    fn register_memory(&self, ctx: ContextId, addr: usize, len: usize, desc: &TensorDesc) -> Result<MemHandle> {
        if desc.dtype != AccelDType::Float32 {
            return Err(HexError::accelerator("mem_register", ApiStatus::NotSupported));
        }
        if len < desc.nbytes() {
            return Err(HexError::InvalidInput(format!(
                "registered region of {len} bytes cannot hold {}",
                desc.name
            )));
        }
        let mut state = self.state.lock();
        if !state.contexts.contains(&ctx.0) {
            return Err(HexError::accelerator("mem_register", ApiStatus::InvalidHandle));
        }
        let id = state.next();
        state.mems.insert(
            id,
            MemRecord {
                context: ctx.0,
                addr,
                len,
            },
        );
        Ok(MemHandle(id))
    }

    fn deregister_memory(&self, handle: MemHandle) -> Result<()> {
        self.state
            .lock()
            .mems
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(HexError::accelerator("mem_deregister", ApiStatus::InvalidHandle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexgraph_core::{PerfProfile, TensorRole};

    fn params() -> ContextParams {
        ContextParams {
            device: 3,
            profile: PerfProfile::HighPerformance,
            thread_count: 1,
            vtcm_mb: 0,
        }
    }

    fn client(tensor: TensorId, data: &[f32]) -> TensorBinding {
        TensorBinding {
            tensor,
            buffer: BufferBinding::Client {
                addr: data.as_ptr() as usize,
                len: std::mem::size_of_val(data),
            },
        }
    }

    fn add_graph(dev: &Coprocessor<HostKernels>, ctx: ContextId) -> (GraphId, [TensorId; 3]) {
        let g = dev.create_graph(ctx, "add").unwrap();
        let desc = |name: &str, role| TensorDesc::new(name, role, AccelDType::Float32, vec![2, 2]);
        let a = dev.create_tensor(g, &desc("a", TensorRole::AppWrite)).unwrap();
        let b = dev.create_tensor(g, &desc("b", TensorRole::AppWrite)).unwrap();
        let o = dev.create_tensor(g, &desc("o", TensorRole::AppRead)).unwrap();
        dev.add_node(
            g,
            &OpNode {
                name: "add".into(),
                op_type: "ElementWiseAdd".into(),
                params: Vec::new(),
                inputs: vec![a, b],
                outputs: vec![o],
            },
        )
        .unwrap();
        (g, [a, b, o])
    }

    #[test]
    fn test_execute_with_client_buffers() {
        let dev = Coprocessor::host();
        let ctx = dev.create_context(&params()).unwrap();
        let (g, [a, b, o]) = add_graph(&dev, ctx);
        dev.finalize_graph(g).unwrap();

        let x = [1.0f32; 4];
        let y = [2.0f32; 4];
        let mut out = [0.0f32; 4];
        let out_binding = TensorBinding {
            tensor: o,
            buffer: BufferBinding::Client {
                addr: out.as_mut_ptr() as usize,
                len: 16,
            },
        };
        unsafe { dev.execute_graph(g, &[client(a, &x), client(b, &y)], &[out_binding]) }.unwrap();
        assert_eq!(out, [3.0; 4]);
    }

    #[test]
    fn test_add_node_after_finalize_is_invalid_state() {
        let dev = Coprocessor::host();
        let ctx = dev.create_context(&params()).unwrap();
        let (g, [a, b, o]) = add_graph(&dev, ctx);
        dev.finalize_graph(g).unwrap();
        let err = dev
            .add_node(
                g,
                &OpNode {
                    name: "again".into(),
                    op_type: "ElementWiseAdd".into(),
                    params: Vec::new(),
                    inputs: vec![a, b],
                    outputs: vec![o],
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            HexError::Accelerator {
                status: ApiStatus::InvalidState,
                ..
            }
        ));
    }

    #[test]
    fn test_execute_before_finalize_rejected() {
        let dev = Coprocessor::host();
        let ctx = dev.create_context(&params()).unwrap();
        let (g, _) = add_graph(&dev, ctx);
        let err = unsafe { dev.execute_graph(g, &[], &[]) }.unwrap_err();
        assert!(matches!(
            err,
            HexError::Accelerator {
                status: ApiStatus::InvalidState,
                ..
            }
        ));
    }

    #[test]
    fn test_shared_binding_must_be_registered() {
        let dev = Coprocessor::host();
        let ctx = dev.create_context(&params()).unwrap();
        let (g, [a, b, o]) = add_graph(&dev, ctx);
        dev.finalize_graph(g).unwrap();

        let x = [4.0f32; 4];
        let y = [0.5f32; 4];
        let desc = TensorDesc::new("a", TensorRole::AppWrite, AccelDType::Float32, vec![2, 2]);
        let mem = dev
            .register_memory(ctx, x.as_ptr() as usize, 16, &desc)
            .unwrap();
        let shared = TensorBinding {
            tensor: a,
            buffer: BufferBinding::Shared {
                mem,
                addr: x.as_ptr() as usize,
                len: 16,
            },
        };
        let mut out = [0.0f32; 4];
        let out_binding = TensorBinding {
            tensor: o,
            buffer: BufferBinding::Client {
                addr: out.as_mut_ptr() as usize,
                len: 16,
            },
        };
        unsafe { dev.execute_graph(g, &[shared.clone(), client(b, &y)], &[out_binding.clone()]) }.unwrap();
        assert_eq!(out, [4.5; 4]);

        dev.deregister_memory(mem).unwrap();
        let err = unsafe { dev.execute_graph(g, &[shared, client(b, &y)], &[out_binding]) }.unwrap_err();
        assert!(matches!(
            err,
            HexError::Accelerator {
                status: ApiStatus::InvalidHandle,
                ..
            }
        ));
    }

    #[test]
    fn test_destroy_context_drops_graphs() {
        let dev = Coprocessor::host();
        let ctx = dev.create_context(&params()).unwrap();
        let (g, _) = add_graph(&dev, ctx);
        dev.destroy_context(ctx).unwrap();
        assert!(dev.destroy_graph(g).is_err());
        assert!(dev.destroy_context(ctx).is_err());
    }
}
