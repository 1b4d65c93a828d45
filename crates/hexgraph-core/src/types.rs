use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HexError, Result};

/// Maximum tensor rank understood by the host runtime and the accelerators.
pub const MAX_DIMS: usize = 4;

/// Host element types.
///
/// Quantized types are stored in 32-element blocks; everything else has a
/// block size of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    BF16,
    I8,
    I32,
    Q4_0,
    Q4_1,
    Q8_0,
}

/// Elements per quantization block.
pub const QK: usize = 32;

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I8 => "i8",
            DType::I32 => "i32",
            DType::Q4_0 => "q4_0",
            DType::Q4_1 => "q4_1",
            DType::Q8_0 => "q8_0",
        }
    }

    pub fn block_size(self) -> usize {
        if self.is_quantized() {
            QK
        } else {
            1
        }
    }

    /// Bytes per block.
    pub fn type_size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 => 1,
            // f16 scale + 32 nibbles
            DType::Q4_0 => 2 + QK / 2,
            // f16 scale + f16 min + 32 nibbles
            DType::Q4_1 => 4 + QK / 2,
            // f16 scale + 32 signed bytes
            DType::Q8_0 => 2 + QK,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, DType::Q4_0 | DType::Q4_1 | DType::Q8_0)
    }

    /// Bytes occupied by `n` consecutive elements.
    pub fn row_size(self, n: usize) -> usize {
        self.type_size() * n / self.block_size()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-axis extents in host order: `ne[0]` is the fastest-varying axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    ne: [usize; MAX_DIMS],
    rank: usize,
}

impl Shape {
    /// Build a shape from host-order extents. Unused trailing axes are 1.
    pub fn new(dims: &[usize]) -> Result<Self> {
        if dims.len() > MAX_DIMS {
            return Err(HexError::InvalidInput(format!(
                "rank {} exceeds maximum {MAX_DIMS}",
                dims.len()
            )));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(HexError::InvalidInput(format!("zero extent in {dims:?}")));
        }
        let mut ne = [1usize; MAX_DIMS];
        ne[..dims.len()].copy_from_slice(dims);
        Ok(Self {
            ne,
            rank: dims.len(),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn dims(&self) -> &[usize] {
        &self.ne[..self.rank]
    }

    /// All four extents, padded with 1.
    pub fn ne(&self) -> [usize; MAX_DIMS] {
        self.ne
    }

    pub fn elements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Number of matrices in a batched view: `ne[2] * ne[3]`.
    pub fn batch(&self) -> usize {
        self.ne[2] * self.ne[3]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.ne;
        write!(f, "{a}x{b}x{c}x{d}")
    }
}

/// Byte strides of a densely packed tensor.
pub fn contiguous_strides(dtype: DType, shape: &Shape) -> [usize; MAX_DIMS] {
    let ne = shape.ne();
    let mut nb = [0usize; MAX_DIMS];
    nb[0] = dtype.type_size();
    nb[1] = dtype.row_size(ne[0]);
    for i in 2..MAX_DIMS {
        nb[i] = nb[i - 1] * ne[i - 1];
    }
    nb
}

/// Element type, extents and strides of a host tensor, without its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub dtype: DType,
    pub shape: Shape,
    pub strides: [usize; MAX_DIMS],
}

impl TensorMeta {
    pub fn contiguous(dtype: DType, shape: Shape) -> Self {
        Self {
            dtype,
            shape,
            strides: contiguous_strides(dtype, &shape),
        }
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(self.dtype, &self.shape)
    }

    /// Bytes spanned by the tensor when densely packed.
    pub fn nbytes(&self) -> usize {
        let ne = self.shape.ne();
        self.dtype.row_size(ne[0]) * ne[1] * ne[2] * ne[3]
    }
}

/// Borrowed, read-only host tensor.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    meta: TensorMeta,
    data: &'a [u8],
}

impl<'a> TensorView<'a> {
    pub fn new(dtype: DType, shape: Shape, data: &'a [u8]) -> Result<Self> {
        Self::with_strides(dtype, shape, contiguous_strides(dtype, &shape), data)
    }

    pub fn with_strides(
        dtype: DType,
        shape: Shape,
        strides: [usize; MAX_DIMS],
        data: &'a [u8],
    ) -> Result<Self> {
        let meta = TensorMeta {
            dtype,
            shape,
            strides,
        };
        check_len(&meta, data.len())?;
        Ok(Self { meta, data })
    }

    pub fn meta(&self) -> TensorMeta {
        self.meta
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn shape(&self) -> Shape {
        self.meta.shape
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

/// Borrowed, writable host tensor (an op's destination).
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    meta: TensorMeta,
    data: &'a mut [u8],
}

impl<'a> TensorViewMut<'a> {
    pub fn new(dtype: DType, shape: Shape, data: &'a mut [u8]) -> Result<Self> {
        let meta = TensorMeta::contiguous(dtype, shape);
        check_len(&meta, data.len())?;
        Ok(Self { meta, data })
    }

    pub fn meta(&self) -> TensorMeta {
        self.meta
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn shape(&self) -> Shape {
        self.meta.shape
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

fn check_len(meta: &TensorMeta, len: usize) -> Result<()> {
    let ne = meta.shape.ne();
    // Offset of the last element plus its size.
    let last = (0..MAX_DIMS)
        .map(|i| (ne[i] - 1) / if i == 0 { meta.dtype.block_size() } else { 1 } * meta.strides[i])
        .sum::<usize>()
        + meta.dtype.type_size();
    if len < last {
        return Err(HexError::InvalidInput(format!(
            "{} tensor of shape {} needs {last} bytes, got {len}",
            meta.dtype, meta.shape
        )));
    }
    Ok(())
}

/// Owned host tensor, used by the CLI, tests and the reference ops.
#[derive(Debug, Clone)]
pub struct HostTensor {
    meta: TensorMeta,
    data: Vec<u8>,
}

impl HostTensor {
    pub fn zeros(dtype: DType, dims: &[usize]) -> Result<Self> {
        let meta = TensorMeta::contiguous(dtype, Shape::new(dims)?);
        Ok(Self {
            data: vec![0u8; meta.nbytes()],
            meta,
        })
    }

    pub fn from_f32(dims: &[usize], values: &[f32]) -> Result<Self> {
        let meta = TensorMeta::contiguous(DType::F32, Shape::new(dims)?);
        if values.len() != meta.shape.elements() {
            return Err(HexError::InvalidInput(format!(
                "{} values for shape {}",
                values.len(),
                meta.shape
            )));
        }
        Ok(Self {
            meta,
            data: bytemuck::cast_slice(values).to_vec(),
        })
    }

    /// Wrap already-encoded bytes (e.g. quantized blocks).
    pub fn from_bytes(dtype: DType, dims: &[usize], data: Vec<u8>) -> Result<Self> {
        let meta = TensorMeta::contiguous(dtype, Shape::new(dims)?);
        if data.len() != meta.nbytes() {
            return Err(HexError::InvalidInput(format!(
                "{} bytes for {dtype} tensor of shape {}",
                data.len(),
                meta.shape
            )));
        }
        Ok(Self { meta, data })
    }

    pub fn meta(&self) -> TensorMeta {
        self.meta
    }

    pub fn shape(&self) -> Shape {
        self.meta.shape
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn view(&self) -> TensorView<'_> {
        TensorView {
            meta: self.meta,
            data: &self.data,
        }
    }

    pub fn view_mut(&mut self) -> TensorViewMut<'_> {
        TensorViewMut {
            meta: self.meta,
            data: &mut self.data,
        }
    }

    /// Copy out the contents of an F32 tensor.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.meta.dtype != DType::F32 {
            return Err(HexError::InvalidInput(format!(
                "to_f32_vec on {} tensor",
                self.meta.dtype
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }
}

/// Unary ops the host runtime dispatches under a single op code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Abs,
    Neg,
    Relu,
    Gelu,
    Silu,
    Tanh,
}

impl UnaryOp {
    pub const COUNT: usize = 6;

    pub const ALL: [UnaryOp; UnaryOp::COUNT] = [
        UnaryOp::Abs,
        UnaryOp::Neg,
        UnaryOp::Relu,
        UnaryOp::Gelu,
        UnaryOp::Silu,
        UnaryOp::Tanh,
    ];

    fn ordinal(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Abs => "ABS",
            UnaryOp::Neg => "NEG",
            UnaryOp::Relu => "RELU",
            UnaryOp::Gelu => "GELU",
            UnaryOp::Silu => "SILU",
            UnaryOp::Tanh => "TANH",
        }
    }
}

/// Operation kinds of the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    None,
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
    Log,
    MulMat,
    Scale,
    RmsNorm,
    SoftMax,
    Transpose,
    Reshape,
    Cpy,
    Rope,
    Unary(UnaryOp),
}

impl OpKind {
    /// Number of non-unary op codes; unary ops are indexed after these.
    pub const BASE_COUNT: usize = 15;

    /// Size of any table indexed by [`OpKind::index`].
    pub const INDEX_COUNT: usize = Self::BASE_COUNT + UnaryOp::COUNT;

    /// Deterministic, dense op-kind → table index mapping.
    pub fn index(self) -> usize {
        match self {
            OpKind::None => 0,
            OpKind::Add => 1,
            OpKind::Sub => 2,
            OpKind::Mul => 3,
            OpKind::Div => 4,
            OpKind::Sqrt => 5,
            OpKind::Log => 6,
            OpKind::MulMat => 7,
            OpKind::Scale => 8,
            OpKind::RmsNorm => 9,
            OpKind::SoftMax => 10,
            OpKind::Transpose => 11,
            OpKind::Reshape => 12,
            OpKind::Cpy => 13,
            OpKind::Rope => 14,
            OpKind::Unary(u) => Self::BASE_COUNT + u.ordinal(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::None => "NONE",
            OpKind::Add => "ADD",
            OpKind::Sub => "SUB",
            OpKind::Mul => "MUL",
            OpKind::Div => "DIV",
            OpKind::Sqrt => "SQRT",
            OpKind::Log => "LOG",
            OpKind::MulMat => "MUL_MAT",
            OpKind::Scale => "SCALE",
            OpKind::RmsNorm => "RMS_NORM",
            OpKind::SoftMax => "SOFT_MAX",
            OpKind::Transpose => "TRANSPOSE",
            OpKind::Reshape => "RESHAPE",
            OpKind::Cpy => "CPY",
            OpKind::Rope => "ROPE",
            OpKind::Unary(u) => u.name(),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One op dispatch from the host runtime: `dst = op(srcs...)`.
#[derive(Debug)]
pub struct OpDispatch<'a> {
    pub op: OpKind,
    pub srcs: Vec<TensorView<'a>>,
    pub dst: TensorViewMut<'a>,
}

impl<'a> OpDispatch<'a> {
    pub fn new(op: OpKind, srcs: Vec<TensorView<'a>>, dst: TensorViewMut<'a>) -> Self {
        Self { op, srcs, dst }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_pads_trailing_axes() {
        let s = Shape::new(&[4, 3]).unwrap();
        assert_eq!(s.rank(), 2);
        assert_eq!(s.ne(), [4, 3, 1, 1]);
        assert_eq!(s.elements(), 12);
        assert_eq!(s.to_string(), "4x3x1x1");
    }

    #[test]
    fn test_shape_rejects_rank_five() {
        assert!(Shape::new(&[1, 1, 1, 1, 1]).is_err());
        assert!(Shape::new(&[2, 0]).is_err());
    }

    #[test]
    fn test_quantized_row_size() {
        assert_eq!(DType::Q8_0.row_size(64), 68);
        assert_eq!(DType::Q4_0.row_size(32), 18);
        assert_eq!(DType::F16.row_size(10), 20);
    }

    #[test]
    fn test_contiguous_strides() {
        let s = Shape::new(&[64, 3, 2]).unwrap();
        assert_eq!(contiguous_strides(DType::F32, &s), [4, 256, 768, 1536]);
        assert_eq!(contiguous_strides(DType::Q8_0, &s), [34, 68, 204, 408]);
    }

    #[test]
    fn test_view_rejects_short_buffer() {
        let shape = Shape::new(&[4, 4]).unwrap();
        let data = vec![0u8; 60];
        assert!(TensorView::new(DType::F32, shape, &data).is_err());
    }

    #[test]
    fn test_op_index_is_dense() {
        let mut seen = vec![false; OpKind::INDEX_COUNT];
        let ops = [
            OpKind::None,
            OpKind::Add,
            OpKind::Sub,
            OpKind::Mul,
            OpKind::Div,
            OpKind::Sqrt,
            OpKind::Log,
            OpKind::MulMat,
            OpKind::Scale,
            OpKind::RmsNorm,
            OpKind::SoftMax,
            OpKind::Transpose,
            OpKind::Reshape,
            OpKind::Cpy,
            OpKind::Rope,
        ];
        for op in ops.into_iter().chain(UnaryOp::ALL.into_iter().map(OpKind::Unary)) {
            assert!(!seen[op.index()], "duplicate index for {op}");
            seen[op.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_host_tensor_roundtrip_f32() {
        let t = HostTensor::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(t.view().data().len(), 16);
    }
}
