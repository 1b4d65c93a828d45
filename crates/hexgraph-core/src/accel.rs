//! Value types that cross the capability-interface boundary.
//!
//! Everything here is described in *accelerator* axis order: axis 0 is the
//! slowest-varying axis, the reverse of the host convention.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::DType;

/// Opaque accelerator execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

/// Opaque accelerator compute graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(pub u64);

/// Tensor identifier, unique within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub u32);

/// Handle to host memory registered with the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u64);

/// Accelerator element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelDType {
    Float32,
    Float16,
    Int8,
    Int32,
    UInt32,
    Bool8,
}

impl AccelDType {
    pub fn size(self) -> usize {
        match self {
            AccelDType::Float32 | AccelDType::Int32 | AccelDType::UInt32 => 4,
            AccelDType::Float16 => 2,
            AccelDType::Int8 | AccelDType::Bool8 => 1,
        }
    }

    /// Accelerator equivalent of a host element type, if one exists.
    pub fn from_host(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F32 => Some(AccelDType::Float32),
            DType::F16 => Some(AccelDType::Float16),
            DType::I8 => Some(AccelDType::Int8),
            DType::I32 => Some(AccelDType::Int32),
            DType::BF16 | DType::Q4_0 | DType::Q4_1 | DType::Q8_0 => None,
        }
    }

    /// Host element type with the same in-memory encoding.
    pub fn to_host(self) -> Option<DType> {
        match self {
            AccelDType::Float32 => Some(DType::F32),
            AccelDType::Float16 => Some(DType::F16),
            AccelDType::Int8 => Some(DType::I8),
            AccelDType::Int32 => Some(DType::I32),
            AccelDType::UInt32 | AccelDType::Bool8 => None,
        }
    }
}

/// Who reads and writes a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    /// Graph input, written by the application before execute.
    AppWrite,
    /// Graph output, read by the application after execute.
    AppRead,
    /// Intermediate, never visible to the application.
    Native,
    /// Constant baked into the graph at build time.
    Static,
}

/// Descriptor used to create an accelerator tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDesc {
    pub name: String,
    pub role: TensorRole,
    pub dtype: AccelDType,
    /// Extents in accelerator order.
    pub dims: Vec<u32>,
    /// Contents of a [`TensorRole::Static`] tensor.
    pub static_data: Option<Vec<u8>>,
}

impl TensorDesc {
    pub fn new(name: impl Into<String>, role: TensorRole, dtype: AccelDType, dims: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            role,
            dtype,
            dims,
            static_data: None,
        }
    }

    /// A static UInt32 vector constant (permutations, tile multiples).
    pub fn static_u32(name: impl Into<String>, values: &[u32]) -> Self {
        Self {
            name: name.into(),
            role: TensorRole::Static,
            dtype: AccelDType::UInt32,
            dims: vec![values.len() as u32],
            static_data: Some(bytemuck::cast_slice(values).to_vec()),
        }
    }

    pub fn elements(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    pub fn nbytes(&self) -> usize {
        self.elements() * self.dtype.size()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    U32(u32),
    F32(f32),
    Tensor(TensorId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeParam {
    pub name: String,
    pub value: ParamValue,
}

impl NodeParam {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One node of an accelerator graph.
#[derive(Debug, Clone, PartialEq)]
pub struct OpNode {
    pub name: String,
    pub op_type: String,
    pub params: Vec<NodeParam>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl OpNode {
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }
}

/// Where an input/output tensor's bytes live for one execute call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferBinding {
    /// Plain host memory, passed by pointer.
    Client { addr: usize, len: usize },
    /// Host memory registered with the accelerator.
    Shared { mem: MemHandle, addr: usize, len: usize },
}

impl BufferBinding {
    pub fn addr(&self) -> usize {
        match *self {
            BufferBinding::Client { addr, .. } | BufferBinding::Shared { addr, .. } => addr,
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            BufferBinding::Client { len, .. } | BufferBinding::Shared { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A graph tensor paired with the buffer it reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorBinding {
    pub tensor: TensorId,
    pub buffer: BufferBinding,
}

/// Non-success status codes reported by a capability interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStatus {
    /// The accelerator explicitly does not support the request.
    NotSupported,
    /// Unknown or already-destroyed handle.
    InvalidHandle,
    /// Request arrived in the wrong lifecycle state (e.g. node after finalize).
    InvalidState,
    /// Any other vendor error code.
    Failure(i64),
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiStatus::NotSupported => f.write_str("NOT_SUPPORTED"),
            ApiStatus::InvalidHandle => f.write_str("INVALID_HANDLE"),
            ApiStatus::InvalidState => f.write_str("INVALID_STATE"),
            ApiStatus::Failure(code) => write!(f, "FAILURE({code})"),
        }
    }
}

/// Power/performance profile requested at context creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PerfProfile {
    Default,
    Balanced,
    #[default]
    HighPerformance,
    Burst,
}

/// Inputs to `Accelerator::create_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub device: u32,
    pub profile: PerfProfile,
    pub thread_count: u32,
    pub vtcm_mb: u32,
}
