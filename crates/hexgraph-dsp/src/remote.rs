//! Kernel runtime backed by the coprocessor kernel library (`libhexdsp.so`).
//!
//! The library exposes one entry point per lifecycle step and a single
//! `hexdsp_invoke` that runs one kernel over flat Float32 buffers.

use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;

use libloading::Library;

use hexgraph_core::{ApiStatus, ContextParams, HexError, Result};

use crate::kernels::{KernelOp, KernelRuntime, Operand, OperandMut};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct DspTensor {
    rank: u32,
    dims: *const u32,
    data: *mut f32,
    len: u32,
}

type FnOpen = unsafe extern "C" fn(u32, u32, u32, c_int) -> c_int;
type FnClose = unsafe extern "C" fn() -> c_int;
type FnInvoke =
    unsafe extern "C" fn(u32, *const u32, u32, *const DspTensor, u32, *mut DspTensor) -> c_int;

/// Dispatches kernels to the coprocessor through its kernel library.
pub struct RemoteKernels {
    _lib: Arc<Library>,
    open: FnOpen,
    close: FnClose,
    invoke: FnInvoke,
}

// The library serializes invocations internally.
unsafe impl Send for RemoteKernels {}
unsafe impl Sync for RemoteKernels {}

fn status(call: &'static str, code: c_int) -> Result<()> {
    match code {
        0 => Ok(()),
        -2 => Err(HexError::accelerator(call, ApiStatus::NotSupported)),
        other => {
            tracing::warn!(call, code = other, "coprocessor kernel call failed");
            Err(HexError::accelerator(call, ApiStatus::Failure(other as i64)))
        }
    }
}

impl RemoteKernels {
    pub fn open_library(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| HexError::Library(format!("{}: {e}", path.display())))?;
        Self::from_library(Arc::new(lib))
    }

    pub fn from_library(lib: Arc<Library>) -> Result<Self> {
        let resolve = |e: libloading::Error| HexError::Library(format!("kernel symbol resolution failed: {e}"));
        unsafe {
            let open = *lib.get::<FnOpen>(b"hexdsp_open\0").map_err(resolve)?;
            let close = *lib.get::<FnClose>(b"hexdsp_close\0").map_err(resolve)?;
            let invoke = *lib.get::<FnInvoke>(b"hexdsp_invoke\0").map_err(resolve)?;
            Ok(Self {
                _lib: lib,
                open,
                close,
                invoke,
            })
        }
    }
}

impl KernelRuntime for RemoteKernels {
    fn name(&self) -> &str {
        "hexdsp"
    }

    fn open(&self, params: &ContextParams) -> Result<()> {
        let profile = params.profile as c_int;
        status("hexdsp_open", unsafe {
            (self.open)(params.device, params.thread_count, params.vtcm_mb, profile)
        })
    }

    fn close(&self) -> Result<()> {
        status("hexdsp_close", unsafe { (self.close)() })
    }

    fn run(&self, op: &KernelOp, inputs: &[Operand<'_>], output: OperandMut<'_>) -> Result<()> {
        let in_dims: Vec<&[u32]> = inputs.iter().map(|o| o.dims).collect();
        op.check_dims(&in_dims, output.dims)
            .map_err(|e| HexError::InvalidInput(format!("{op:?}: {e}")))?;

        let params = op.params();
        // The library only reads input buffers.
        let raw_inputs: Vec<DspTensor> = inputs
            .iter()
            .map(|o| DspTensor {
                rank: o.dims.len() as u32,
                dims: o.dims.as_ptr(),
                data: o.data.as_ptr() as *mut f32,
                len: o.data.len() as u32,
            })
            .collect();
        let mut raw_output = DspTensor {
            rank: output.dims.len() as u32,
            dims: output.dims.as_ptr(),
            data: output.data.as_mut_ptr(),
            len: output.data.len() as u32,
        };
        status("hexdsp_invoke", unsafe {
            (self.invoke)(
                op.code(),
                params.as_ptr(),
                params.len() as u32,
                raw_inputs.as_ptr(),
                raw_inputs.len() as u32,
                &mut raw_output,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_library_error() {
        let err = RemoteKernels::open_library(Path::new("/nonexistent/libhexdsp.so"))
            .err()
            .unwrap();
        assert!(matches!(err, HexError::Library(_)));
    }

    #[test]
    fn test_status_codes() {
        assert!(status("x", 0).is_ok());
        assert!(status("x", -2).unwrap_err().is_unsupported());
        assert!(!status("x", -1).unwrap_err().is_unsupported());
    }
}
