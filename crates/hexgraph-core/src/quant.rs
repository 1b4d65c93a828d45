//! Host-side dequantization used to stage operands whose element type the
//! accelerator cannot consume directly.

use half::{bf16, f16};

use crate::error::{HexError, Result};
use crate::types::{DType, QK};

/// Numeric-kernel collaborator that widens host element types to f32.
pub trait Dequantizer: Send + Sync {
    fn supports(&self, dtype: DType) -> bool;

    /// Decode the first `n` elements of `src` into f32.
    fn to_f32(&self, dtype: DType, src: &[u8], n: usize) -> Result<Vec<f32>>;
}

/// Decoder for the standard 32-element block formats plus f16/bf16.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockDequantizer;

impl Dequantizer for BlockDequantizer {
    fn supports(&self, dtype: DType) -> bool {
        !matches!(dtype, DType::I8 | DType::I32)
    }

    fn to_f32(&self, dtype: DType, src: &[u8], n: usize) -> Result<Vec<f32>> {
        if n % dtype.block_size() != 0 {
            return Err(HexError::InvalidInput(format!(
                "{n} elements is not a whole number of {dtype} blocks"
            )));
        }
        let need = dtype.row_size(n);
        if src.len() < need {
            return Err(HexError::InvalidInput(format!(
                "{dtype}: need {need} bytes for {n} elements, got {}",
                src.len()
            )));
        }
        let src = &src[..need];

        let out = match dtype {
            DType::F32 => bytemuck::pod_collect_to_vec(src),
            DType::F16 => src
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            DType::BF16 => src
                .chunks_exact(2)
                .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            DType::Q4_0 => dequantize_q4_0(src),
            DType::Q4_1 => dequantize_q4_1(src),
            DType::Q8_0 => dequantize_q8_0(src),
            DType::I8 | DType::I32 => {
                return Err(HexError::Unsupported(format!("no dequantizer for {dtype}")))
            }
        };
        Ok(out)
    }
}

fn read_f16(b: &[u8]) -> f32 {
    f16::from_le_bytes([b[0], b[1]]).to_f32()
}

fn dequantize_q4_0(src: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(src.len() / DType::Q4_0.type_size() * QK);
    for block in src.chunks_exact(DType::Q4_0.type_size()) {
        let d = read_f16(&block[0..2]);
        let qs = &block[2..];
        let mut vals = [0f32; QK];
        for (j, &q) in qs.iter().enumerate() {
            vals[j] = ((q & 0x0F) as i32 - 8) as f32 * d;
            vals[j + QK / 2] = ((q >> 4) as i32 - 8) as f32 * d;
        }
        out.extend_from_slice(&vals);
    }
    out
}

fn dequantize_q4_1(src: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(src.len() / DType::Q4_1.type_size() * QK);
    for block in src.chunks_exact(DType::Q4_1.type_size()) {
        let d = read_f16(&block[0..2]);
        let m = read_f16(&block[2..4]);
        let qs = &block[4..];
        let mut vals = [0f32; QK];
        for (j, &q) in qs.iter().enumerate() {
            vals[j] = (q & 0x0F) as f32 * d + m;
            vals[j + QK / 2] = (q >> 4) as f32 * d + m;
        }
        out.extend_from_slice(&vals);
    }
    out
}

fn dequantize_q8_0(src: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(src.len() / DType::Q8_0.type_size() * QK);
    for block in src.chunks_exact(DType::Q8_0.type_size()) {
        let d = read_f16(&block[0..2]);
        out.extend(block[2..].iter().map(|&q| (q as i8) as f32 * d));
    }
    out
}

/// Encode f32 values as Q8_0 blocks. `values.len()` must be a multiple of 32.
pub fn quantize_q8_0(values: &[f32]) -> Result<Vec<u8>> {
    if values.len() % QK != 0 {
        return Err(HexError::InvalidInput(format!(
            "{} values is not a whole number of q8_0 blocks",
            values.len()
        )));
    }
    let mut out = Vec::with_capacity(DType::Q8_0.row_size(values.len()));
    for block in values.chunks_exact(QK) {
        let amax = block.iter().fold(0f32, |m, v| m.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        out.extend_from_slice(&f16::from_f32(d).to_le_bytes());
        out.extend(block.iter().map(|&v| (v * id).round() as i8 as u8));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_q8_0_roundtrip_within_scale() {
        let values: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) / 16.0).collect();
        let encoded = quantize_q8_0(&values).unwrap();
        assert_eq!(encoded.len(), DType::Q8_0.row_size(64));

        let decoded = BlockDequantizer.to_f32(DType::Q8_0, &encoded, 64).unwrap();
        for (a, b) in values.iter().zip(&decoded) {
            assert!((a - b).abs() < 0.02, "{a} vs {b}");
        }
    }

    #[test]
    fn test_q4_0_nibble_order() {
        // d = 1.0, low nibbles 9 (→ +1), high nibbles 6 (→ -2).
        let mut block = f16::from_f32(1.0).to_le_bytes().to_vec();
        block.extend(std::iter::repeat(0x69u8).take(16));
        let decoded = BlockDequantizer.to_f32(DType::Q4_0, &block, 32).unwrap();
        assert!(decoded[..16].iter().all(|&v| v == 1.0));
        assert!(decoded[16..].iter().all(|&v| v == -2.0));
    }

    #[test]
    fn test_q4_1_applies_min() {
        let mut block = f16::from_f32(0.5).to_le_bytes().to_vec();
        block.extend_from_slice(&f16::from_f32(-1.0).to_le_bytes());
        block.extend(std::iter::repeat(0x20u8).take(16));
        let decoded = BlockDequantizer.to_f32(DType::Q4_1, &block, 32).unwrap();
        assert_eq!(decoded[0], -1.0);
        assert_eq!(decoded[16], 0.0);
    }

    #[test]
    fn test_f16_decode() {
        let bytes: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect();
        assert_eq!(BlockDequantizer.to_f32(DType::F16, &bytes, 2).unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_partial_block_rejected() {
        let bytes = vec![0u8; 34];
        assert!(BlockDequantizer.to_f32(DType::Q8_0, &bytes, 16).is_err());
        assert!(BlockDequantizer.to_f32(DType::Q8_0, &bytes[..20], 32).is_err());
    }
}
