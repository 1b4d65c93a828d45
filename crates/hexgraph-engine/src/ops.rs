//! Op dispatch table: host op kind → accelerator op metadata.

use hexgraph_core::{HexError, OpKind, Result};

/// One row of the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCapability {
    /// Accelerator op type name passed to `add_node`.
    pub op_name: &'static str,
    /// Number of source tensors the op consumes.
    pub input_count: usize,
    /// Name of the op's single node parameter, if it has one.
    pub param: Option<&'static str>,
}

pub const MATMUL_TRANSPOSE_IN1: &str = "transpose_in1";

pub const OP_MATMUL: &str = "MatMul";
pub const OP_TRANSPOSE: &str = "Transpose";
pub const OP_RESHAPE: &str = "Reshape";
pub const OP_TILE: &str = "Tile";
pub const PARAM_PERM: &str = "perm";
pub const PARAM_MULTIPLES: &str = "multiples";

const fn row(op_name: &'static str, input_count: usize, param: Option<&'static str>) -> Option<OpCapability> {
    Some(OpCapability {
        op_name,
        input_count,
        param,
    })
}

/// Indexed by [`OpKind::index`].
static OP_TABLE: [Option<OpCapability>; OpKind::INDEX_COUNT] = [
    None,                                              // NONE
    row("ElementWiseAdd", 2, None),                    // ADD
    row("ElementWiseSubtract", 2, None),               // SUB
    row("ElementWiseMultiply", 2, None),               // MUL
    row("ElementWiseDivide", 2, None),                 // DIV
    row("ElementWiseSquareRoot", 1, None),             // SQRT
    row("ElementWiseLog", 1, None),                    // LOG
    row(OP_MATMUL, 2, Some(MATMUL_TRANSPOSE_IN1)),     // MUL_MAT
    None,                                              // SCALE
    None,                                              // RMS_NORM
    None,                                              // SOFT_MAX
    None,                                              // TRANSPOSE
    None,                                              // RESHAPE
    None,                                              // CPY
    None,                                              // ROPE
    None,                                              // ABS
    None,                                              // NEG
    None,                                              // RELU
    None,                                              // GELU
    None,                                              // SILU
    None,                                              // TANH
];

/// Look up the accelerator op for `op`. A missing row means the backend
/// cannot offload the op and the caller must fall back.
pub fn lookup(op: OpKind) -> Result<&'static OpCapability> {
    OP_TABLE[op.index()]
        .as_ref()
        .ok_or_else(|| HexError::Unsupported(format!("no accelerator op for {op}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexgraph_core::UnaryOp;

    #[test]
    fn test_binary_rows() {
        for (op, name) in [
            (OpKind::Add, "ElementWiseAdd"),
            (OpKind::Sub, "ElementWiseSubtract"),
            (OpKind::Mul, "ElementWiseMultiply"),
            (OpKind::Div, "ElementWiseDivide"),
        ] {
            let cap = lookup(op).unwrap();
            assert_eq!(cap.op_name, name);
            assert_eq!(cap.input_count, 2);
            assert_eq!(cap.param, None);
        }
    }

    #[test]
    fn test_matmul_row_has_param() {
        let cap = lookup(OpKind::MulMat).unwrap();
        assert_eq!(cap.op_name, "MatMul");
        assert_eq!(cap.param, Some("transpose_in1"));
    }

    #[test]
    fn test_missing_rows_are_unsupported() {
        for op in [OpKind::None, OpKind::SoftMax, OpKind::Rope, OpKind::Unary(UnaryOp::Gelu)] {
            assert!(lookup(op).unwrap_err().is_unsupported());
        }
    }
}
