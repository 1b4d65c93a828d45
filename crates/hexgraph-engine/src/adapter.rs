//! Tensor adapter: host tensor descriptions → accelerator descriptors.
//!
//! The host numbers axes from the innermost outwards (`ne[0]` varies
//! fastest); the accelerator numbers them from the outermost inwards. Every
//! descriptor built here therefore lists the host extents in reverse:
//! accelerator axis `i` is host axis `rank - 1 - i`. Getting this wrong does
//! not fail loudly, it silently computes on a transposed tensor.

use std::borrow::Cow;

use hexgraph_core::{
    AccelDType, DType, Dequantizer, HexError, Result, TensorDesc, TensorMeta, TensorRole, TensorView, MAX_DIMS,
};

/// An accelerator descriptor plus what the engine needs to feed it.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelTensor {
    pub desc: TensorDesc,
    /// Element type of the host tensor the descriptor was built from.
    pub host_dtype: DType,
    /// The host bytes must be converted before binding.
    pub staged: bool,
    /// `desc` holds the op's natural output layout; a transpose node is
    /// needed to reach the host layout.
    pub needs_transpose: bool,
}

impl AccelTensor {
    /// Bytes bound for this tensor: accelerator elements times the
    /// accelerator element size, which differs from the host size when
    /// staged.
    pub fn byte_len(&self) -> usize {
        self.desc.nbytes()
    }
}

/// Accelerator extents for host extents `ne` viewed at `rank`.
pub fn reversed_dims(ne: &[usize; MAX_DIMS], rank: usize) -> Vec<u32> {
    ne[..rank].iter().rev().map(|&d| d as u32).collect()
}

/// Build the accelerator descriptor for a host tensor.
///
/// `forced_dtype` requests a specific accelerator element type; when it
/// differs from the host type the tensor is marked for staging.
/// `rank_override` views the tensor at a higher rank (extra axes are 1).
/// `transpose` swaps the last two accelerator axes and marks the tensor as
/// needing a follow-up transpose node.
pub fn to_accelerator_tensor(
    name: impl Into<String>,
    meta: &TensorMeta,
    role: TensorRole,
    forced_dtype: Option<AccelDType>,
    rank_override: Option<usize>,
    transpose: bool,
) -> Result<AccelTensor> {
    let name = name.into();
    let host_rank = meta.shape.rank();
    let rank = rank_override.unwrap_or(host_rank);
    if host_rank == 0 || rank == 0 || rank > MAX_DIMS {
        return Err(HexError::Unsupported(format!("{name}: rank {rank} outside 1..={MAX_DIMS}")));
    }
    if rank < host_rank {
        return Err(HexError::InvalidInput(format!(
            "{name}: rank override {rank} below tensor rank {host_rank}"
        )));
    }

    let direct = AccelDType::from_host(meta.dtype);
    let dtype = match (forced_dtype, direct) {
        (Some(forced), _) => forced,
        (None, Some(d)) => d,
        (None, None) => {
            return Err(HexError::Unsupported(format!(
                "{name}: {} has no accelerator equivalent",
                meta.dtype
            )))
        }
    };
    let staged = direct != Some(dtype);
    if staged && dtype != AccelDType::Float32 {
        return Err(HexError::Unsupported(format!(
            "{name}: cannot stage {} as {dtype:?}",
            meta.dtype
        )));
    }

    let mut dims = reversed_dims(&meta.shape.ne(), rank);
    if transpose {
        if rank < 2 {
            return Err(HexError::InvalidInput(format!("{name}: cannot transpose rank {rank}")));
        }
        dims.swap(rank - 2, rank - 1);
    }

    Ok(AccelTensor {
        desc: TensorDesc::new(name, role, dtype, dims),
        host_dtype: meta.dtype,
        staged,
        needs_transpose: transpose,
    })
}

/// Bytes to bind for an input: the host data itself, or a Float32 copy
/// produced by the dequantizer when the tensor is staged.
pub fn stage_input<'a>(
    view: &TensorView<'a>,
    tensor: &AccelTensor,
    dequantizer: &dyn Dequantizer,
) -> Result<Cow<'a, [u8]>> {
    let meta = view.meta();
    let bytes: Cow<'a, [u8]> = if tensor.staged {
        let values = dequantizer.to_f32(meta.dtype, view.data(), meta.shape.elements())?;
        Cow::Owned(bytemuck::cast_slice(&values).to_vec())
    } else {
        Cow::Borrowed(&view.data()[..meta.nbytes()])
    };
    assert_eq!(
        bytes.len(),
        tensor.byte_len(),
        "bound size of {} disagrees with its descriptor",
        tensor.desc.name
    );
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexgraph_core::{quantize_q8_0, BlockDequantizer, HostTensor, Shape};

    fn meta(dtype: DType, dims: &[usize]) -> TensorMeta {
        TensorMeta::contiguous(dtype, Shape::new(dims).unwrap())
    }

    #[test]
    fn test_axes_are_reversed_for_every_rank() {
        let host = [7usize, 5, 3, 2];
        for rank in 1..=4 {
            let m = meta(DType::F32, &host[..rank]);
            let t = to_accelerator_tensor("t", &m, TensorRole::AppWrite, None, None, false).unwrap();
            assert_eq!(t.desc.dims.len(), rank);
            for i in 0..rank {
                assert_eq!(t.desc.dims[i] as usize, host[rank - 1 - i]);
            }
        }
    }

    #[test]
    fn test_rank_override_pads_outer_axes() {
        let m = meta(DType::F32, &[8, 4]);
        let t = to_accelerator_tensor("t", &m, TensorRole::AppWrite, None, Some(4), false).unwrap();
        assert_eq!(t.desc.dims, vec![1, 1, 4, 8]);
    }

    #[test]
    fn test_transpose_swaps_inner_axes() {
        let m = meta(DType::F32, &[16, 32, 3]);
        let t = to_accelerator_tensor("t", &m, TensorRole::Native, None, None, true).unwrap();
        assert_eq!(t.desc.dims, vec![3, 16, 32]);
        assert!(t.needs_transpose);
    }

    #[test]
    fn test_quantized_requires_forced_type() {
        let m = meta(DType::Q8_0, &[64, 2]);
        let err = to_accelerator_tensor("w", &m, TensorRole::AppWrite, None, None, false).unwrap_err();
        assert!(err.is_unsupported());

        let t = to_accelerator_tensor("w", &m, TensorRole::AppWrite, Some(AccelDType::Float32), None, false)
            .unwrap();
        assert!(t.staged);
        assert_eq!(t.byte_len(), 64 * 2 * 4);
    }

    #[test]
    fn test_rank_five_override_rejected() {
        let m = meta(DType::F32, &[2]);
        assert!(to_accelerator_tensor("t", &m, TensorRole::AppWrite, None, Some(5), false).is_err());
    }

    #[test]
    fn test_stage_input_dequantizes() {
        let values: Vec<f32> = (0..64).map(|i| i as f32 / 8.0 - 4.0).collect();
        let q = quantize_q8_0(&values).unwrap();
        let host = HostTensor::from_bytes(DType::Q8_0, &[64], q).unwrap();
        let t = to_accelerator_tensor("w", &host.meta(), TensorRole::AppWrite, Some(AccelDType::Float32), None, false)
            .unwrap();
        let bytes = stage_input(&host.view(), &t, &BlockDequantizer).unwrap();
        let staged: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        for (a, b) in staged.iter().zip(&values) {
            assert!((a - b).abs() < 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn test_stage_input_borrows_native() {
        let host = HostTensor::from_f32(&[4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let t = to_accelerator_tensor("x", &host.meta(), TensorRole::AppWrite, None, None, false).unwrap();
        let bytes = stage_input(&host.view(), &t, &BlockDequantizer).unwrap();
        assert!(matches!(bytes, Cow::Borrowed(_)));
        assert_eq!(bytes.as_ptr(), host.bytes().as_ptr());
    }
}
