use rayon::prelude::*;

use hexgraph_core::{ContextParams, HexError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline]
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Sqrt,
    Log,
}

/// A coprocessor kernel with its parameters resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOp {
    Binary(BinaryOp),
    Unary(UnaryFn),
    MatMul { transpose_in0: bool, transpose_in1: bool },
    Transpose { perm: Vec<u32> },
    Reshape,
    Tile { multiples: Vec<u32> },
}

impl KernelOp {
    pub fn arity(&self) -> usize {
        match self {
            KernelOp::Binary(_) | KernelOp::MatMul { .. } => 2,
            _ => 1,
        }
    }

    /// Wire code understood by the remote kernel library.
    pub fn code(&self) -> u32 {
        match self {
            KernelOp::Binary(BinaryOp::Add) => 1,
            KernelOp::Binary(BinaryOp::Sub) => 2,
            KernelOp::Binary(BinaryOp::Mul) => 3,
            KernelOp::Binary(BinaryOp::Div) => 4,
            KernelOp::Unary(UnaryFn::Sqrt) => 5,
            KernelOp::Unary(UnaryFn::Log) => 6,
            KernelOp::MatMul { .. } => 7,
            KernelOp::Transpose { .. } => 8,
            KernelOp::Reshape => 9,
            KernelOp::Tile { .. } => 10,
        }
    }

    /// Integer parameters in wire order.
    pub fn params(&self) -> Vec<u32> {
        match self {
            KernelOp::MatMul {
                transpose_in0,
                transpose_in1,
            } => vec![*transpose_in0 as u32, *transpose_in1 as u32],
            KernelOp::Transpose { perm } => perm.clone(),
            KernelOp::Tile { multiples } => multiples.clone(),
            _ => Vec::new(),
        }
    }

    /// Verify that `output` is the shape this op produces from `inputs`.
    pub fn check_dims(&self, inputs: &[&[u32]], output: &[u32]) -> std::result::Result<(), String> {
        if inputs.len() != self.arity() {
            return Err(format!("expected {} inputs, got {}", self.arity(), inputs.len()));
        }
        let expected = match self {
            KernelOp::Binary(_) => broadcast_dims(inputs[0], inputs[1])?,
            KernelOp::Unary(_) => inputs[0].to_vec(),
            KernelOp::MatMul {
                transpose_in0,
                transpose_in1,
            } => matmul_dims(inputs[0], inputs[1], *transpose_in0, *transpose_in1)?,
            KernelOp::Transpose { perm } => {
                let dims = inputs[0];
                if perm.len() != dims.len() {
                    return Err(format!("perm {perm:?} does not match rank {}", dims.len()));
                }
                let mut seen = vec![false; dims.len()];
                for &p in perm {
                    let p = p as usize;
                    if p >= dims.len() || seen[p] {
                        return Err(format!("perm {perm:?} is not a permutation"));
                    }
                    seen[p] = true;
                }
                perm.iter().map(|&p| dims[p as usize]).collect()
            }
            KernelOp::Reshape => {
                let from: u64 = inputs[0].iter().map(|&d| d as u64).product();
                let to: u64 = output.iter().map(|&d| d as u64).product();
                if from != to {
                    return Err(format!("reshape {:?} -> {output:?} changes element count", inputs[0]));
                }
                output.to_vec()
            }
            KernelOp::Tile { multiples } => {
                let dims = inputs[0];
                if multiples.len() != dims.len() {
                    return Err(format!("multiples {multiples:?} do not match rank {}", dims.len()));
                }
                dims.iter().zip(multiples).map(|(d, m)| d * m).collect()
            }
        };
        if expected != output {
            return Err(format!("output dims {output:?}, expected {expected:?}"));
        }
        Ok(())
    }
}

fn broadcast_dims(a: &[u32], b: &[u32]) -> std::result::Result<Vec<u32>, String> {
    let rank = a.len().max(b.len());
    let mut out = vec![1u32; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(format!("cannot broadcast {a:?} with {b:?}")),
        };
    }
    Ok(out)
}

fn matmul_dims(a: &[u32], b: &[u32], t0: bool, t1: bool) -> std::result::Result<Vec<u32>, String> {
    if a.len() < 2 || a.len() != b.len() {
        return Err(format!("matmul rank mismatch {a:?} x {b:?}"));
    }
    let r = a.len();
    if a[..r - 2] != b[..r - 2] {
        return Err(format!("matmul batch mismatch {a:?} x {b:?}"));
    }
    let (m, k) = if t0 { (a[r - 1], a[r - 2]) } else { (a[r - 2], a[r - 1]) };
    let (kb, n) = if t1 { (b[r - 1], b[r - 2]) } else { (b[r - 2], b[r - 1]) };
    if k != kb {
        return Err(format!("matmul inner dimension mismatch {k} vs {kb}"));
    }
    let mut out = a[..r - 2].to_vec();
    out.push(m);
    out.push(n);
    Ok(out)
}

/// Read-only kernel argument in accelerator axis order.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a> {
    pub dims: &'a [u32],
    pub data: &'a [f32],
}

#[derive(Debug)]
pub struct OperandMut<'a> {
    pub dims: &'a [u32],
    pub data: &'a mut [f32],
}

/// Executes single kernels on the coprocessor.
pub trait KernelRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Open a session; called once per execution context.
    fn open(&self, _params: &ContextParams) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn run(&self, op: &KernelOp, inputs: &[Operand<'_>], output: OperandMut<'_>) -> Result<()>;
}

/// In-process kernels, parallelized with rayon.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostKernels;

fn contiguous_strides(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1] as usize;
    }
    strides
}

/// Strides of `dims` viewed through the broadcast shape `out` (0 on
/// broadcast axes).
fn broadcast_strides(dims: &[u32], out: &[u32]) -> Vec<usize> {
    let offset = out.len() - dims.len();
    let own = contiguous_strides(dims);
    let mut strides = vec![0usize; out.len()];
    for (i, &d) in dims.iter().enumerate() {
        if d != 1 {
            strides[i + offset] = own[i];
        }
    }
    strides
}

#[inline]
fn offset(mut linear: usize, dims: &[u32], strides: &[usize]) -> usize {
    let mut off = 0;
    for ax in (0..dims.len()).rev() {
        let d = dims[ax] as usize;
        off += (linear % d) * strides[ax];
        linear /= d;
    }
    off
}

fn elements(dims: &[u32]) -> usize {
    dims.iter().map(|&d| d as usize).product()
}

impl KernelRuntime for HostKernels {
    fn name(&self) -> &str {
        "host"
    }

    fn run(&self, op: &KernelOp, inputs: &[Operand<'_>], output: OperandMut<'_>) -> Result<()> {
        let in_dims: Vec<&[u32]> = inputs.iter().map(|o| o.dims).collect();
        op.check_dims(&in_dims, output.dims)
            .map_err(|e| HexError::InvalidInput(format!("{op:?}: {e}")))?;
        for operand in inputs {
            let need = elements(operand.dims);
            if operand.data.len() != need {
                return Err(HexError::InvalidInput(format!(
                    "{op:?}: buffer holds {} values, dims {:?} need {need}",
                    operand.data.len(),
                    operand.dims
                )));
            }
        }
        if output.data.len() != elements(output.dims) {
            return Err(HexError::InvalidInput(format!(
                "{op:?}: output buffer holds {} values, dims {:?}",
                output.data.len(),
                output.dims
            )));
        }

        let out_dims = output.dims;
        let out = output.data;
        match op {
            KernelOp::Binary(bin) => {
                let (a, b) = (inputs[0], inputs[1]);
                let sa = broadcast_strides(a.dims, out_dims);
                let sb = broadcast_strides(b.dims, out_dims);
                let bin = *bin;
                out.par_iter_mut().enumerate().for_each(|(i, o)| {
                    *o = bin.apply(a.data[offset(i, out_dims, &sa)], b.data[offset(i, out_dims, &sb)]);
                });
            }
            KernelOp::Unary(f) => {
                let src = inputs[0].data;
                match f {
                    UnaryFn::Sqrt => out.par_iter_mut().zip(src).for_each(|(o, &x)| *o = x.sqrt()),
                    UnaryFn::Log => out.par_iter_mut().zip(src).for_each(|(o, &x)| *o = x.ln()),
                }
            }
            KernelOp::MatMul {
                transpose_in0,
                transpose_in1,
            } => matmul(inputs[0], inputs[1], *transpose_in0, *transpose_in1, out_dims, out),
            KernelOp::Transpose { perm } => {
                let src = inputs[0];
                let own = contiguous_strides(src.dims);
                let strides: Vec<usize> = perm.iter().map(|&p| own[p as usize]).collect();
                out.par_iter_mut().enumerate().for_each(|(i, o)| {
                    *o = src.data[offset(i, out_dims, &strides)];
                });
            }
            KernelOp::Reshape => out.copy_from_slice(inputs[0].data),
            KernelOp::Tile { .. } => {
                let src = inputs[0];
                let own = contiguous_strides(src.dims);
                out.par_iter_mut().enumerate().for_each(|(i, o)| {
                    let mut linear = i;
                    let mut off = 0;
                    for ax in (0..out_dims.len()).rev() {
                        let d = out_dims[ax] as usize;
                        off += (linear % d % src.dims[ax] as usize) * own[ax];
                        linear /= d;
                    }
                    *o = src.data[off];
                });
            }
        }
        Ok(())
    }
}

fn matmul(a: Operand<'_>, b: Operand<'_>, t0: bool, t1: bool, out_dims: &[u32], out: &mut [f32]) {
    let r = out_dims.len();
    let m = out_dims[r - 2] as usize;
    let n = out_dims[r - 1] as usize;
    let k = if t0 { a.dims[r - 2] } else { a.dims[r - 1] } as usize;

    out.par_chunks_mut(n).enumerate().for_each(|(row, dst)| {
        let batch = row / m;
        let mi = row % m;
        let a_base = batch * m * k;
        let b_base = batch * k * n;
        for (ni, d) in dst.iter_mut().enumerate() {
            let mut acc = 0f32;
            for ki in 0..k {
                let av = if t0 {
                    a.data[a_base + ki * m + mi]
                } else {
                    a.data[a_base + mi * k + ki]
                };
                let bv = if t1 {
                    b.data[b_base + ni * k + ki]
                } else {
                    b.data[b_base + ki * n + ni]
                };
                acc += av * bv;
            }
            *d = acc;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(op: KernelOp, inputs: &[(&[u32], &[f32])], out_dims: &[u32]) -> Vec<f32> {
        let operands: Vec<Operand> = inputs
            .iter()
            .map(|(dims, data)| Operand { dims, data })
            .collect();
        let mut out = vec![0f32; elements(out_dims)];
        HostKernels
            .run(
                &op,
                &operands,
                OperandMut {
                    dims: out_dims,
                    data: &mut out,
                },
            )
            .unwrap();
        out
    }

    #[test]
    fn test_add_broadcasts_row() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [10.0, 20.0, 30.0];
        let out = run(
            KernelOp::Binary(BinaryOp::Add),
            &[(&[2, 3], &a), (&[3], &b)],
            &[2, 3],
        );
        assert_eq!(out, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_matmul_transpose_in1() {
        // a = [[1,2],[3,4]], b^T rows = [[1,0],[0,1],[1,1]] → a·b = [[1,2,3],[3,4,7]]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let out = run(
            KernelOp::MatMul {
                transpose_in0: false,
                transpose_in1: true,
            },
            &[(&[2, 2], &a), (&[3, 2], &b)],
            &[2, 3],
        );
        assert_eq!(out, vec![1.0, 2.0, 3.0, 3.0, 4.0, 7.0]);
    }

    #[test]
    fn test_transpose_rank3() {
        let x: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let out = run(
            KernelOp::Transpose { perm: vec![0, 2, 1] },
            &[(&[2, 2, 3], &x)],
            &[2, 3, 2],
        );
        assert_eq!(out[..6], [0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert_eq!(out[6..], [6.0, 9.0, 7.0, 10.0, 8.0, 11.0]);
    }

    #[test]
    fn test_tile_repeats_whole_block() {
        let x = [1.0, 2.0];
        let out = run(
            KernelOp::Tile {
                multiples: vec![3, 1],
            },
            &[(&[1, 2], &x)],
            &[3, 2],
        );
        assert_eq!(out, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_check_dims_rejects_bad_matmul() {
        let op = KernelOp::MatMul {
            transpose_in0: false,
            transpose_in1: false,
        };
        assert!(op.check_dims(&[&[2, 3], &[4, 5]], &[2, 5]).is_err());
        assert!(op.check_dims(&[&[2, 3], &[3, 5]], &[2, 5]).is_ok());
    }

    #[test]
    fn test_check_dims_rejects_non_permutation() {
        let op = KernelOp::Transpose { perm: vec![0, 0] };
        assert!(op.check_dims(&[&[2, 3]], &[2, 2]).is_err());
    }
}
