//! Raw FFI surface of the NPU SDK C shim (`libhexsdk_*.so`).
//!
//! The shim exposes the vendor graph API as plain `extern "C"` functions.
//! Nothing is linked at build time: the symbols are resolved from a
//! `libloading::Library` so one process can talk to several SDK builds
//! (CPU / GPU / NPU backends) and run without any of them installed.
//!
//! # Safety
//! All function pointers in this crate are unsafe FFI calls. Use
//! `hexgraph-sdk` for safe Rust wrappers.

#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use libloading::Library;

pub type SdkHandle = *mut c_void;
pub type SdkStatus = i64;

pub const SDK_SUCCESS: SdkStatus = 0;
pub const SDK_ERROR_GENERAL: SdkStatus = 1000;
pub const SDK_ERROR_NOT_SUPPORTED: SdkStatus = 1001;
pub const SDK_ERROR_INVALID_HANDLE: SdkStatus = 1002;
pub const SDK_ERROR_GRAPH_FINALIZED: SdkStatus = 6010;
pub const SDK_ERROR_MEM_ALLOC: SdkStatus = 1010;

/// Accelerator data types (matches the shim's `HexSdkDataType` values).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkDataType {
    Int8 = 0x0008,
    Int32 = 0x0032,
    UInt32 = 0x0132,
    Float16 = 0x0216,
    Float32 = 0x0232,
    Bool8 = 0x0508,
}

impl SdkDataType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0x0008 => Some(Self::Int8),
            0x0032 => Some(Self::Int32),
            0x0132 => Some(Self::UInt32),
            0x0216 => Some(Self::Float16),
            0x0232 => Some(Self::Float32),
            0x0508 => Some(Self::Bool8),
            _ => None,
        }
    }
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkTensorType {
    AppWrite = 0,
    AppRead = 1,
    Native = 3,
    Static = 4,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkMemType {
    Raw = 0,
    MemHandle = 1,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkParamType {
    Scalar = 0,
    Tensor = 1,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SdkClientBuffer {
    pub data: *mut c_void,
    pub data_size: u32,
}

impl Default for SdkClientBuffer {
    fn default() -> Self {
        Self {
            data: std::ptr::null_mut(),
            data_size: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SdkTensor {
    pub id: u32,
    pub name: *const c_char,
    pub tensor_type: SdkTensorType,
    pub data_type: SdkDataType,
    pub rank: u32,
    pub dims: *const u32,
    pub mem_type: SdkMemType,
    pub client_buf: SdkClientBuffer,
    pub mem_handle: SdkHandle,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union SdkScalarValue {
    pub bool8: u8,
    pub uint32: u32,
    pub float32: f32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SdkScalar {
    pub data_type: SdkDataType,
    pub value: SdkScalarValue,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SdkParam {
    pub param_type: SdkParamType,
    pub name: *const c_char,
    pub scalar: SdkScalar,
    pub tensor: SdkTensor,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SdkOpConfig {
    pub name: *const c_char,
    pub package_name: *const c_char,
    pub type_name: *const c_char,
    pub num_params: u32,
    pub params: *const SdkParam,
    pub num_inputs: u32,
    pub inputs: *const SdkTensor,
    pub num_outputs: u32,
    pub outputs: *const SdkTensor,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SdkContextConfig {
    pub device_id: u32,
    pub perf_profile: i32,
    pub thread_count: u32,
    pub vtcm_mb: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SdkMemDescriptor {
    pub rank: u32,
    pub dims: *const u32,
    pub data_type: SdkDataType,
    pub fd: c_int,
}

/// Package name for the vendor's built-in op set.
pub const SDK_OP_PACKAGE: &[u8] = b"hex.sdk.builtin\0";

pub type FnApiVersion = unsafe extern "C" fn(*mut u32, *mut u32, *mut u32) -> SdkStatus;
pub type FnContextCreate = unsafe extern "C" fn(*const SdkContextConfig, *mut SdkHandle) -> SdkStatus;
pub type FnContextFree = unsafe extern "C" fn(SdkHandle) -> SdkStatus;
pub type FnGraphCreate = unsafe extern "C" fn(SdkHandle, *const c_char, *mut SdkHandle) -> SdkStatus;
pub type FnTensorCreate = unsafe extern "C" fn(SdkHandle, *mut SdkTensor) -> SdkStatus;
pub type FnGraphAddNode = unsafe extern "C" fn(SdkHandle, *const SdkOpConfig) -> SdkStatus;
pub type FnGraphFinalize = unsafe extern "C" fn(SdkHandle) -> SdkStatus;
pub type FnGraphExecute =
    unsafe extern "C" fn(SdkHandle, *const SdkTensor, u32, *mut SdkTensor, u32) -> SdkStatus;
pub type FnGraphFree = unsafe extern "C" fn(SdkHandle) -> SdkStatus;
pub type FnMemRegister =
    unsafe extern "C" fn(SdkHandle, *const SdkMemDescriptor, *mut SdkHandle) -> SdkStatus;
pub type FnMemDeregister = unsafe extern "C" fn(*const SdkHandle, u32) -> SdkStatus;

/// Resolved SDK entry points. The owning library is kept alive alongside
/// the function pointers.
pub struct SdkApi {
    _lib: Arc<Library>,
    pub api_version: FnApiVersion,
    pub context_create: FnContextCreate,
    pub context_free: FnContextFree,
    pub graph_create: FnGraphCreate,
    pub tensor_create_graph_tensor: FnTensorCreate,
    pub graph_add_node: FnGraphAddNode,
    pub graph_finalize: FnGraphFinalize,
    pub graph_execute: FnGraphExecute,
    /// Older shims free graphs together with their context only.
    pub graph_free: Option<FnGraphFree>,
    pub mem_register: FnMemRegister,
    pub mem_deregister: FnMemDeregister,
}

// Function pointers stay valid while `_lib` is alive; the shim itself is
// thread-safe for calls on distinct handles.
unsafe impl Send for SdkApi {}
unsafe impl Sync for SdkApi {}

unsafe fn sym<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, libloading::Error> {
    lib.get::<T>(name).map(|s| *s)
}

impl SdkApi {
    /// Resolve every SDK entry point from `lib`.
    ///
    /// # Safety
    /// `lib` must be an SDK shim whose exported symbols have the signatures
    /// declared in this module.
    pub unsafe fn load(lib: Arc<Library>) -> Result<Self, libloading::Error> {
        Ok(Self {
            api_version: sym(&lib, b"hexsdk_api_version\0")?,
            context_create: sym(&lib, b"hexsdk_context_create\0")?,
            context_free: sym(&lib, b"hexsdk_context_free\0")?,
            graph_create: sym(&lib, b"hexsdk_graph_create\0")?,
            tensor_create_graph_tensor: sym(&lib, b"hexsdk_tensor_create_graph_tensor\0")?,
            graph_add_node: sym(&lib, b"hexsdk_graph_add_node\0")?,
            graph_finalize: sym(&lib, b"hexsdk_graph_finalize\0")?,
            graph_execute: sym(&lib, b"hexsdk_graph_execute\0")?,
            graph_free: sym(&lib, b"hexsdk_graph_free\0").ok(),
            mem_register: sym(&lib, b"hexsdk_mem_register\0")?,
            mem_deregister: sym(&lib, b"hexsdk_mem_deregister\0")?,
            _lib: lib,
        })
    }
}

pub const RPCMEM_HEAP_ID_SYSTEM: c_int = 25;
pub const RPCMEM_DEFAULT_FLAGS: u32 = 1;

pub type FnRpcMemAlloc = unsafe extern "C" fn(c_int, u32, c_int) -> *mut c_void;
pub type FnRpcMemFree = unsafe extern "C" fn(*mut c_void);
pub type FnRpcMemToFd = unsafe extern "C" fn(*mut c_void) -> c_int;

/// Entry points of the remote-memory allocator library (`libcdsprpc.so`).
pub struct RpcMemApi {
    _lib: Arc<Library>,
    pub alloc: FnRpcMemAlloc,
    pub free: FnRpcMemFree,
    pub to_fd: FnRpcMemToFd,
}

unsafe impl Send for RpcMemApi {}
unsafe impl Sync for RpcMemApi {}

impl RpcMemApi {
    /// # Safety
    /// `lib` must export the rpcmem C API.
    pub unsafe fn load(lib: Arc<Library>) -> Result<Self, libloading::Error> {
        Ok(Self {
            alloc: sym(&lib, b"rpcmem_alloc\0")?,
            free: sym(&lib, b"rpcmem_free\0")?,
            to_fd: sym(&lib, b"rpcmem_to_fd\0")?,
            _lib: lib,
        })
    }
}
