//! Plain host implementations of every offloadable op, used to check
//! accelerator results.

use hexgraph_core::{BlockDequantizer, Dequantizer, HexError, OpKind, Result, Shape, TensorView};

fn to_f32(view: &TensorView<'_>) -> Result<Vec<f32>> {
    let meta = view.meta();
    if !meta.is_contiguous() {
        return Err(HexError::InvalidInput("reference ops need contiguous tensors".into()));
    }
    BlockDequantizer.to_f32(meta.dtype, view.data(), meta.shape.elements())
}

fn linear(ne: &[usize; 4], i: [usize; 4]) -> usize {
    ((i[3] * ne[2] + i[2]) * ne[1] + i[1]) * ne[0] + i[0]
}

/// Compute `op(srcs)` into a new F32 buffer shaped `dst`.
///
/// Elementwise sources broadcast along axes of extent 1. Matmul computes
/// `dst[b][n][m] = Σk src0[b mod A_batch][m][k] · src1[b][n][k]`, i.e.
/// operand A is tiled across the batch of operand B.
pub fn reference_compute(op: OpKind, srcs: &[TensorView<'_>], dst: &Shape) -> Result<Vec<f32>> {
    let values = srcs.iter().map(to_f32).collect::<Result<Vec<_>>>()?;
    let ne = dst.ne();
    let mut out = vec![0f32; dst.elements()];

    let binary = |f: fn(f32, f32) -> f32, out: &mut [f32]| -> Result<()> {
        let (sa, sb) = (srcs[0].shape().ne(), srcs[1].shape().ne());
        for axis in 0..4 {
            for s in [sa, sb] {
                if s[axis] != ne[axis] && s[axis] != 1 {
                    return Err(HexError::InvalidInput(format!("cannot broadcast {s:?} to {ne:?}")));
                }
            }
        }
        let pick = |s: &[usize; 4], i: [usize; 4]| linear(s, std::array::from_fn(|a| if s[a] == 1 { 0 } else { i[a] }));
        for i3 in 0..ne[3] {
            for i2 in 0..ne[2] {
                for i1 in 0..ne[1] {
                    for i0 in 0..ne[0] {
                        let i = [i0, i1, i2, i3];
                        out[linear(&ne, i)] = f(values[0][pick(&sa, i)], values[1][pick(&sb, i)]);
                    }
                }
            }
        }
        Ok(())
    };

    match op {
        OpKind::Add => binary(|a, b| a + b, &mut out)?,
        OpKind::Sub => binary(|a, b| a - b, &mut out)?,
        OpKind::Mul => binary(|a, b| a * b, &mut out)?,
        OpKind::Div => binary(|a, b| a / b, &mut out)?,
        OpKind::Sqrt => out.iter_mut().zip(&values[0]).for_each(|(o, x)| *o = x.sqrt()),
        OpKind::Log => out.iter_mut().zip(&values[0]).for_each(|(o, x)| *o = x.ln()),
        OpKind::MulMat => {
            let [k, m, a2, a3] = srcs[0].shape().ne();
            let [kb, n, b2, b3] = srcs[1].shape().ne();
            let a_batch = a2 * a3;
            if k != kb || ne != [m, n, b2, b3] || (b2 * b3) % a_batch != 0 {
                return Err(HexError::InvalidInput(format!(
                    "matmul shapes {:?} x {:?} -> {ne:?}",
                    srcs[0].shape().ne(),
                    srcs[1].shape().ne()
                )));
            }
            let (a, w) = (&values[0], &values[1]);
            for batch in 0..b2 * b3 {
                let ab = batch % a_batch;
                for j in 0..n {
                    let w_row = &w[(batch * n + j) * k..][..k];
                    for i in 0..m {
                        let a_row = &a[(ab * m + i) * k..][..k];
                        out[(batch * n + j) * m + i] = a_row.iter().zip(w_row).map(|(x, y)| x * y).sum();
                    }
                }
            }
        }
        other => return Err(HexError::Unsupported(format!("no reference for {other}"))),
    }
    Ok(out)
}

/// Normalized mean squared error: Σ(e-a)² / Σe².
pub fn nmse(expected: &[f32], actual: &[f32]) -> f64 {
    assert_eq!(expected.len(), actual.len(), "nmse over buffers of different length");
    let (mut err, mut norm) = (0f64, 0f64);
    for (&e, &a) in expected.iter().zip(actual) {
        let d = e as f64 - a as f64;
        err += d * d;
        norm += e as f64 * e as f64;
    }
    if norm == 0.0 {
        err
    } else {
        err / norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexgraph_core::HostTensor;

    #[test]
    fn test_add_broadcasts_row() {
        let a = HostTensor::from_f32(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = HostTensor::from_f32(&[3, 1], &[10.0, 20.0, 30.0]).unwrap();
        let out = reference_compute(OpKind::Add, &[a.view(), b.view()], &a.shape()).unwrap();
        assert_eq!(out, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_matmul_small() {
        // src0 rows (M=2, K=2): [1,2], [3,4]; src1 rows (N=3): [1,0], [0,1], [1,1]
        let a = HostTensor::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let w = HostTensor::from_f32(&[2, 3], &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let dst = Shape::new(&[2, 3]).unwrap();
        let out = reference_compute(OpKind::MulMat, &[a.view(), w.view()], &dst).unwrap();
        // dst[n][m] = row_m(a) · row_n(w)
        assert_eq!(out, vec![1.0, 3.0, 2.0, 4.0, 3.0, 7.0]);
    }

    #[test]
    fn test_matmul_tiles_a_over_batch() {
        let a = HostTensor::from_f32(&[1, 1, 2], &[2.0, 3.0]).unwrap();
        let w = HostTensor::from_f32(&[1, 1, 4], &[1.0, 1.0, 1.0, 1.0]).unwrap();
        let dst = Shape::new(&[1, 1, 4]).unwrap();
        let out = reference_compute(OpKind::MulMat, &[a.view(), w.view()], &dst).unwrap();
        assert_eq!(out, vec![2.0, 3.0, 2.0, 3.0]);
    }

    #[test]
    fn test_nmse() {
        assert_eq!(nmse(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
        assert!((nmse(&[1.0, 1.0], &[1.1, 0.9]) - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_unsupported_op() {
        let a = HostTensor::from_f32(&[2], &[1.0, 2.0]).unwrap();
        assert!(reference_compute(OpKind::SoftMax, &[a.view()], &a.shape())
            .unwrap_err()
            .is_unsupported());
    }
}
