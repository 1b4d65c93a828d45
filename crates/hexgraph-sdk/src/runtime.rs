use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;

use hexgraph_core::{
    Accelerator, ApiStatus, BufferBinding, ContextId, ContextParams, GraphId, HexError, MemHandle,
    OpNode, ParamValue, Result, TensorBinding, TensorDesc, TensorId,
};
use hexgraph_sdk_sys::{
    SdkApi, SdkClientBuffer, SdkContextConfig, SdkDataType, SdkHandle, SdkMemDescriptor,
    SdkMemType, SdkOpConfig, SdkParam, SdkParamType, SdkScalar, SdkScalarValue, SdkTensor,
    SdkTensorType, RpcMemApi, SDK_OP_PACKAGE,
};

use crate::convert::{check, sdk_dtype, sdk_perf_profile, sdk_tensor_type};

/// Capability interface backed by the vendor NPU SDK shim.
pub struct NpuSdk {
    name: String,
    api: SdkApi,
    rpcmem: Option<Arc<RpcMemApi>>,
    state: Mutex<SdkState>,
}

#[derive(Default)]
struct SdkState {
    next_id: u64,
    contexts: HashMap<u64, usize>,
    graphs: HashMap<u64, GraphRecord>,
    mems: HashMap<u64, usize>,
}

impl SdkState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct GraphRecord {
    handle: usize,
    context: u64,
    tensors: HashMap<u32, TensorRecord>,
}

/// Everything needed to rebuild an `SdkTensor` for later calls. The
/// CString and dims vector own the memory the raw struct points into.
struct TensorRecord {
    name: CString,
    dims: Vec<u32>,
    tensor_type: SdkTensorType,
    data_type: SdkDataType,
}

impl TensorRecord {
    fn raw(&self, id: u32) -> SdkTensor {
        SdkTensor {
            id,
            name: self.name.as_ptr(),
            tensor_type: self.tensor_type,
            data_type: self.data_type,
            rank: self.dims.len() as u32,
            dims: self.dims.as_ptr(),
            mem_type: SdkMemType::Raw,
            client_buf: SdkClientBuffer::default(),
            mem_handle: std::ptr::null_mut(),
        }
    }
}

/// Placeholder tensor for scalar params; the shim ignores it.
fn blank_tensor() -> SdkTensor {
    SdkTensor {
        id: 0,
        name: std::ptr::null(),
        tensor_type: SdkTensorType::Native,
        data_type: SdkDataType::Float32,
        rank: 0,
        dims: std::ptr::null(),
        mem_type: SdkMemType::Raw,
        client_buf: SdkClientBuffer::default(),
        mem_handle: std::ptr::null_mut(),
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| HexError::InvalidInput(format!("interior NUL in name {s:?}")))
}

impl NpuSdk {
    /// Resolve the SDK from an already-loaded library.
    ///
    /// `rpcmem` is the remote-memory allocator library; without it memory
    /// registration reports `NotSupported`.
    pub fn new(name: impl Into<String>, lib: Arc<Library>, rpcmem: Option<Arc<RpcMemApi>>) -> Result<Self> {
        let api = unsafe { SdkApi::load(lib) }
            .map_err(|e| HexError::Library(format!("SDK symbol resolution failed: {e}")))?;

        let (mut major, mut minor, mut patch) = (0u32, 0u32, 0u32);
        check("api_version", unsafe {
            (api.api_version)(&mut major, &mut minor, &mut patch)
        })?;

        let name = name.into();
        tracing::info!(
            backend = %name,
            version = %format!("{major}.{minor}.{patch}"),
            "NPU SDK loaded"
        );

        Ok(Self {
            name,
            api,
            rpcmem,
            state: Mutex::new(SdkState::default()),
        })
    }

    fn graph_handle(&self, graph: GraphId) -> Result<usize> {
        self.state
            .lock()
            .graphs
            .get(&graph.0)
            .map(|g| g.handle)
            .ok_or_else(|| HexError::accelerator("graph_lookup", ApiStatus::InvalidHandle))
    }

    fn raw_tensors(
        &self,
        graph: GraphId,
        ids: &[TensorId],
    ) -> Result<Vec<SdkTensor>> {
        let state = self.state.lock();
        let record = state
            .graphs
            .get(&graph.0)
            .ok_or_else(|| HexError::accelerator("graph_lookup", ApiStatus::InvalidHandle))?;
        ids.iter()
            .map(|id| {
                record
                    .tensors
                    .get(&id.0)
                    .map(|t| t.raw(id.0))
                    .ok_or_else(|| HexError::accelerator("tensor_lookup", ApiStatus::InvalidHandle))
            })
            .collect()
    }

    fn bound_tensors(&self, graph: GraphId, bindings: &[TensorBinding]) -> Result<Vec<SdkTensor>> {
        let ids: Vec<TensorId> = bindings.iter().map(|b| b.tensor).collect();
        let mut raw = self.raw_tensors(graph, &ids)?;
        let state = self.state.lock();
        for (tensor, binding) in raw.iter_mut().zip(bindings) {
            match binding.buffer {
                BufferBinding::Client { addr, len } => {
                    tensor.mem_type = SdkMemType::Raw;
                    tensor.client_buf = SdkClientBuffer {
                        data: addr as *mut c_void,
                        data_size: len as u32,
                    };
                }
                BufferBinding::Shared { mem, .. } => {
                    let handle = state.mems.get(&mem.0).copied().ok_or_else(|| {
                        HexError::accelerator("mem_lookup", ApiStatus::InvalidHandle)
                    })?;
                    tensor.mem_type = SdkMemType::MemHandle;
                    tensor.mem_handle = handle as SdkHandle;
                }
            }
        }
        Ok(raw)
    }
}

impl Accelerator for NpuSdk {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_context(&self, params: &ContextParams) -> Result<ContextId> {
        let config = SdkContextConfig {
            device_id: params.device,
            perf_profile: sdk_perf_profile(params.profile),
            thread_count: params.thread_count,
            vtcm_mb: params.vtcm_mb,
        };
        let mut handle: SdkHandle = std::ptr::null_mut();
        check("context_create", unsafe {
            (self.api.context_create)(&config, &mut handle)
        })?;
        if handle.is_null() {
            return Err(HexError::accelerator("context_create", ApiStatus::Failure(-1)));
        }

        let mut state = self.state.lock();
        let id = state.next();
        state.contexts.insert(id, handle as usize);
        tracing::debug!(backend = %self.name, context = id, ?params, "created SDK context");
        Ok(ContextId(id))
    }

    fn destroy_context(&self, ctx: ContextId) -> Result<()> {
        let handle = {
            let mut state = self.state.lock();
            state.graphs.retain(|_, g| g.context != ctx.0);
            state.contexts.remove(&ctx.0)
        };
        let handle =
            handle.ok_or_else(|| HexError::accelerator("context_free", ApiStatus::InvalidHandle))?;
        check("context_free", unsafe {
            (self.api.context_free)(handle as SdkHandle)
        })
    }

    fn create_graph(&self, ctx: ContextId, name: &str) -> Result<GraphId> {
        let ctx_handle = self
            .state
            .lock()
            .contexts
            .get(&ctx.0)
            .copied()
            .ok_or_else(|| HexError::accelerator("graph_create", ApiStatus::InvalidHandle))?;
        let name_c = cstring(name)?;
        let mut handle: SdkHandle = std::ptr::null_mut();
        check("graph_create", unsafe {
            (self.api.graph_create)(ctx_handle as SdkHandle, name_c.as_ptr(), &mut handle)
        })?;

        let mut state = self.state.lock();
        let id = state.next();
        state.graphs.insert(
            id,
            GraphRecord {
                handle: handle as usize,
                context: ctx.0,
                tensors: HashMap::new(),
            },
        );
        tracing::trace!(graph = name, id, "created SDK graph");
        Ok(GraphId(id))
    }

    fn create_tensor(&self, graph: GraphId, desc: &TensorDesc) -> Result<TensorId> {
        let graph_handle = self.graph_handle(graph)?;
        let record = TensorRecord {
            name: cstring(&desc.name)?,
            dims: desc.dims.clone(),
            tensor_type: sdk_tensor_type(desc.role),
            data_type: sdk_dtype(desc.dtype),
        };
        let mut raw = record.raw(0);
        if let Some(data) = &desc.static_data {
            raw.client_buf = SdkClientBuffer {
                data: data.as_ptr() as *mut c_void,
                data_size: data.len() as u32,
            };
        }
        check("tensor_create_graph_tensor", unsafe {
            (self.api.tensor_create_graph_tensor)(graph_handle as SdkHandle, &mut raw)
        })?;

        let id = raw.id;
        let mut state = self.state.lock();
        if let Some(g) = state.graphs.get_mut(&graph.0) {
            g.tensors.insert(id, record);
        }
        Ok(TensorId(id))
    }

    fn add_node(&self, graph: GraphId, node: &OpNode) -> Result<()> {
        let graph_handle = self.graph_handle(graph)?;
        let inputs = self.raw_tensors(graph, &node.inputs)?;
        let outputs = self.raw_tensors(graph, &node.outputs)?;

        // Param names must outlive the call.
        let param_names: Vec<CString> = node
            .params
            .iter()
            .map(|p| cstring(&p.name))
            .collect::<Result<_>>()?;
        let mut params = Vec::with_capacity(node.params.len());
        for (param, name) in node.params.iter().zip(&param_names) {
            let (param_type, scalar, tensor) = match param.value {
                ParamValue::Bool(b) => (
                    SdkParamType::Scalar,
                    SdkScalar {
                        data_type: SdkDataType::Bool8,
                        value: SdkScalarValue { bool8: b as u8 },
                    },
                    None,
                ),
                ParamValue::U32(v) => (
                    SdkParamType::Scalar,
                    SdkScalar {
                        data_type: SdkDataType::UInt32,
                        value: SdkScalarValue { uint32: v },
                    },
                    None,
                ),
                ParamValue::F32(v) => (
                    SdkParamType::Scalar,
                    SdkScalar {
                        data_type: SdkDataType::Float32,
                        value: SdkScalarValue { float32: v },
                    },
                    None,
                ),
                ParamValue::Tensor(id) => (
                    SdkParamType::Tensor,
                    SdkScalar {
                        data_type: SdkDataType::UInt32,
                        value: SdkScalarValue { uint32: 0 },
                    },
                    Some(self.raw_tensors(graph, &[id])?[0]),
                ),
            };
            params.push(SdkParam {
                param_type,
                name: name.as_ptr(),
                scalar,
                tensor: tensor.unwrap_or_else(blank_tensor),
            });
        }

        let name_c = cstring(&node.name)?;
        let type_c = cstring(&node.op_type)?;
        let config = SdkOpConfig {
            name: name_c.as_ptr(),
            package_name: SDK_OP_PACKAGE.as_ptr().cast(),
            type_name: type_c.as_ptr(),
            num_params: params.len() as u32,
            params: params.as_ptr(),
            num_inputs: inputs.len() as u32,
            inputs: inputs.as_ptr(),
            num_outputs: outputs.len() as u32,
            outputs: outputs.as_ptr(),
        };
        check("graph_add_node", unsafe {
            (self.api.graph_add_node)(graph_handle as SdkHandle, &config)
        })
    }

    fn finalize_graph(&self, graph: GraphId) -> Result<()> {
        let handle = self.graph_handle(graph)?;
        check("graph_finalize", unsafe {
            (self.api.graph_finalize)(handle as SdkHandle)
        })
    }

    unsafe fn execute_graph(
        &self,
        graph: GraphId,
        inputs: &[TensorBinding],
        outputs: &[TensorBinding],
    ) -> Result<()> {
        let handle = self.graph_handle(graph)?;
        let raw_inputs = self.bound_tensors(graph, inputs)?;
        let mut raw_outputs = self.bound_tensors(graph, outputs)?;
        check(
            "graph_execute",
            (self.api.graph_execute)(
                handle as SdkHandle,
                raw_inputs.as_ptr(),
                raw_inputs.len() as u32,
                raw_outputs.as_mut_ptr(),
                raw_outputs.len() as u32,
            ),
        )
    }

    fn destroy_graph(&self, graph: GraphId) -> Result<()> {
        let record = self
            .state
            .lock()
            .graphs
            .remove(&graph.0)
            .ok_or_else(|| HexError::accelerator("graph_free", ApiStatus::InvalidHandle))?;
        match self.api.graph_free {
            Some(free) => check("graph_free", unsafe { free(record.handle as SdkHandle) }),
            // Released together with the context.
            None => Ok(()),
        }
    }

    fn register_memory(&self, ctx: ContextId, addr: usize, _len: usize, desc: &TensorDesc) -> Result<MemHandle> {
        let rpcmem = self
            .rpcmem
            .as_ref()
            .ok_or_else(|| HexError::accelerator("mem_register", ApiStatus::NotSupported))?;
        let ctx_handle = self
            .state
            .lock()
            .contexts
            .get(&ctx.0)
            .copied()
            .ok_or_else(|| HexError::accelerator("mem_register", ApiStatus::InvalidHandle))?;

        let fd = unsafe { (rpcmem.to_fd)(addr as *mut c_void) };
        if fd < 0 {
            return Err(HexError::accelerator("rpcmem_to_fd", ApiStatus::Failure(fd as i64)));
        }
        let descriptor = SdkMemDescriptor {
            rank: desc.dims.len() as u32,
            dims: desc.dims.as_ptr(),
            data_type: sdk_dtype(desc.dtype),
            fd,
        };
        let mut handle: SdkHandle = std::ptr::null_mut();
        check("mem_register", unsafe {
            (self.api.mem_register)(ctx_handle as SdkHandle, &descriptor, &mut handle)
        })?;

        let mut state = self.state.lock();
        let id = state.next();
        state.mems.insert(id, handle as usize);
        tracing::debug!(fd, addr = %format_args!("0x{addr:x}"), "registered shared memory");
        Ok(MemHandle(id))
    }

    fn deregister_memory(&self, handle: MemHandle) -> Result<()> {
        let raw = self
            .state
            .lock()
            .mems
            .remove(&handle.0)
            .ok_or_else(|| HexError::accelerator("mem_deregister", ApiStatus::InvalidHandle))?;
        let raw = raw as SdkHandle;
        check("mem_deregister", unsafe { (self.api.mem_deregister)(&raw, 1) })
    }
}
