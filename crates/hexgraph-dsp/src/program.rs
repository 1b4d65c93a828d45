use hexgraph_core::{AccelDType, ApiStatus, HexError, OpNode, ParamValue, Result, TensorDesc, TensorId, TensorRole};

use crate::kernels::{BinaryOp, KernelOp, KernelRuntime, Operand, OperandMut, UnaryFn};

#[derive(Debug)]
struct Step {
    name: String,
    op: KernelOp,
    inputs: Vec<usize>,
    output: usize,
}

/// A coprocessor graph: tensors plus kernels in insertion order.
///
/// Tensor ids are `index + 1` so that 0 never names a tensor. Nodes must be
/// added in dependency order; every input has to exist (app input, static
/// or produced by an earlier node) when the node is added.
#[derive(Debug)]
pub struct Program {
    name: String,
    tensors: Vec<TensorDesc>,
    produced: Vec<bool>,
    steps: Vec<Step>,
}

fn index_of(id: TensorId) -> usize {
    (id.0 as usize).wrapping_sub(1)
}

fn not_supported(what: String) -> HexError {
    tracing::debug!(%what, "coprocessor rejected request");
    HexError::accelerator("add_node", ApiStatus::NotSupported)
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tensors: Vec::new(),
            produced: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.steps.len()
    }

    pub fn tensor(&self, id: TensorId) -> Result<&TensorDesc> {
        self.tensors
            .get(index_of(id))
            .ok_or(HexError::accelerator("tensor_lookup", ApiStatus::InvalidHandle))
    }

    pub fn add_tensor(&mut self, desc: &TensorDesc) -> Result<TensorId> {
        match (desc.dtype, desc.role) {
            (AccelDType::Float32, _) | (AccelDType::UInt32, TensorRole::Static) => {}
            (dtype, role) => {
                tracing::debug!(?dtype, ?role, tensor = %desc.name, "unsupported coprocessor tensor");
                return Err(HexError::accelerator("create_tensor", ApiStatus::NotSupported));
            }
        }
        if desc.dims.is_empty() || desc.dims.contains(&0) {
            return Err(HexError::InvalidInput(format!(
                "tensor {} has degenerate dims {:?}",
                desc.name, desc.dims
            )));
        }
        match (&desc.static_data, desc.role) {
            (Some(data), TensorRole::Static) if data.len() == desc.nbytes() => {}
            (None, role) if role != TensorRole::Static => {}
            _ => {
                return Err(HexError::InvalidInput(format!(
                    "tensor {} static data does not match its role or size",
                    desc.name
                )))
            }
        }
        self.tensors.push(desc.clone());
        self.produced.push(false);
        Ok(TensorId(self.tensors.len() as u32))
    }

    fn static_u32(&self, node: &OpNode, param: &str) -> Result<Vec<u32>> {
        let id = match node.param(param) {
            Some(ParamValue::Tensor(id)) => *id,
            other => {
                return Err(HexError::InvalidInput(format!(
                    "node {} param {param} must reference a tensor, got {other:?}",
                    node.name
                )))
            }
        };
        let desc = self.tensor(id)?;
        match (&desc.static_data, desc.dtype) {
            (Some(bytes), AccelDType::UInt32) => Ok(bytemuck::pod_collect_to_vec(bytes)),
            _ => Err(HexError::InvalidInput(format!(
                "node {} param {param} is not a static UInt32 tensor",
                node.name
            ))),
        }
    }

    fn flag(node: &OpNode, param: &str) -> Result<bool> {
        match node.param(param) {
            None => Ok(false),
            Some(ParamValue::Bool(b)) => Ok(*b),
            Some(ParamValue::U32(v)) => Ok(*v != 0),
            Some(other) => Err(HexError::InvalidInput(format!(
                "node {} param {param} must be boolean, got {other:?}",
                node.name
            ))),
        }
    }

    fn kernel_for(&self, node: &OpNode) -> Result<KernelOp> {
        Ok(match node.op_type.as_str() {
            "ElementWiseAdd" => KernelOp::Binary(BinaryOp::Add),
            "ElementWiseSubtract" => KernelOp::Binary(BinaryOp::Sub),
            "ElementWiseMultiply" => KernelOp::Binary(BinaryOp::Mul),
            "ElementWiseDivide" => KernelOp::Binary(BinaryOp::Div),
            "ElementWiseSquareRoot" => KernelOp::Unary(UnaryFn::Sqrt),
            "ElementWiseLog" => KernelOp::Unary(UnaryFn::Log),
            "MatMul" => KernelOp::MatMul {
                transpose_in0: Self::flag(node, "transpose_in0")?,
                transpose_in1: Self::flag(node, "transpose_in1")?,
            },
            "Transpose" => KernelOp::Transpose {
                perm: self.static_u32(node, "perm")?,
            },
            "Reshape" => KernelOp::Reshape,
            "Tile" => KernelOp::Tile {
                multiples: self.static_u32(node, "multiples")?,
            },
            other => return Err(not_supported(format!("op type {other}"))),
        })
    }

    pub fn add_node(&mut self, node: &OpNode) -> Result<()> {
        let op = self.kernel_for(node)?;
        if node.outputs.len() != 1 {
            return Err(HexError::InvalidInput(format!(
                "node {} must have exactly one output",
                node.name
            )));
        }

        let mut inputs = Vec::with_capacity(node.inputs.len());
        for &id in &node.inputs {
            let desc = self.tensor(id)?;
            let idx = index_of(id);
            let ready = match desc.role {
                TensorRole::AppWrite => true,
                TensorRole::Static => desc.dtype == AccelDType::Float32,
                TensorRole::Native | TensorRole::AppRead => self.produced[idx],
            };
            if !ready {
                return Err(HexError::InvalidInput(format!(
                    "node {} reads tensor {} before it is produced",
                    node.name, desc.name
                )));
            }
            inputs.push(idx);
        }

        let output = index_of(node.outputs[0]);
        let out_desc = self.tensor(node.outputs[0])?;
        if !matches!(out_desc.role, TensorRole::Native | TensorRole::AppRead) || self.produced[output] {
            return Err(HexError::InvalidInput(format!(
                "node {} cannot write tensor {}",
                node.name, out_desc.name
            )));
        }

        let in_dims: Vec<&[u32]> = inputs.iter().map(|&i| self.tensors[i].dims.as_slice()).collect();
        op.check_dims(&in_dims, &out_desc.dims)
            .map_err(|e| HexError::InvalidInput(format!("node {}: {e}", node.name)))?;

        self.produced[output] = true;
        self.steps.push(Step {
            name: node.name.clone(),
            op,
            inputs,
            output,
        });
        Ok(())
    }

    /// Check that every app-read tensor is written by some node.
    pub fn validate(&self) -> Result<()> {
        for (desc, &produced) in self.tensors.iter().zip(&self.produced) {
            if desc.role == TensorRole::AppRead && !produced {
                return Err(HexError::InvalidInput(format!(
                    "graph {}: output {} is never written",
                    self.name, desc.name
                )));
            }
        }
        Ok(())
    }

    /// Run every kernel in order. `feeds` supplies app-write tensors; the
    /// values of `fetch` are returned in the same order.
    pub fn run<R: KernelRuntime + ?Sized>(
        &self,
        runtime: &R,
        feeds: Vec<(TensorId, Vec<f32>)>,
        fetch: &[TensorId],
    ) -> Result<Vec<Vec<f32>>> {
        let mut values: Vec<Option<Vec<f32>>> = self
            .tensors
            .iter()
            .map(|t| match (&t.static_data, t.dtype) {
                (Some(bytes), AccelDType::Float32) => Some(bytemuck::pod_collect_to_vec(bytes)),
                _ => None,
            })
            .collect();

        for (id, data) in feeds {
            let desc = self.tensor(id)?;
            if desc.role != TensorRole::AppWrite || data.len() != desc.elements() {
                return Err(HexError::InvalidInput(format!(
                    "feed for {} has {} values, expected {} into an app-write tensor",
                    desc.name,
                    data.len(),
                    desc.elements()
                )));
            }
            values[index_of(id)] = Some(data);
        }

        for step in &self.steps {
            let mut out = vec![0f32; self.tensors[step.output].elements()];
            {
                let mut operands = Vec::with_capacity(step.inputs.len());
                for &i in &step.inputs {
                    let data = values[i].as_deref().ok_or_else(|| {
                        HexError::InvalidInput(format!(
                            "node {}: input {} was not fed",
                            step.name, self.tensors[i].name
                        ))
                    })?;
                    operands.push(Operand {
                        dims: &self.tensors[i].dims,
                        data,
                    });
                }
                runtime.run(
                    &step.op,
                    &operands,
                    OperandMut {
                        dims: &self.tensors[step.output].dims,
                        data: &mut out,
                    },
                )?;
            }
            values[step.output] = Some(out);
        }

        fetch
            .iter()
            .map(|&id| {
                let name = &self.tensor(id)?.name;
                values[index_of(id)]
                    .clone()
                    .ok_or_else(|| HexError::InvalidInput(format!("tensor {name} has no value")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::HostKernels;
    use hexgraph_core::NodeParam;

    fn f32_tensor(name: &str, role: TensorRole, dims: &[u32]) -> TensorDesc {
        TensorDesc::new(name, role, AccelDType::Float32, dims.to_vec())
    }

    fn node(op_type: &str, inputs: &[TensorId], output: TensorId) -> OpNode {
        OpNode {
            name: format!("{op_type}_node"),
            op_type: op_type.into(),
            params: Vec::new(),
            inputs: inputs.to_vec(),
            outputs: vec![output],
        }
    }

    #[test]
    fn test_tensor_ids_start_at_one() {
        let mut p = Program::new("g");
        let a = p.add_tensor(&f32_tensor("a", TensorRole::AppWrite, &[2])).unwrap();
        let b = p.add_tensor(&f32_tensor("b", TensorRole::AppWrite, &[2])).unwrap();
        assert_eq!((a, b), (TensorId(1), TensorId(2)));
        assert!(p.tensor(TensorId(0)).is_err());
    }

    #[test]
    fn test_fp16_tensor_not_supported() {
        let mut p = Program::new("g");
        let desc = TensorDesc::new("h", TensorRole::AppWrite, AccelDType::Float16, vec![4]);
        assert!(p.add_tensor(&desc).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_unknown_op_not_supported() {
        let mut p = Program::new("g");
        let a = p.add_tensor(&f32_tensor("a", TensorRole::AppWrite, &[2])).unwrap();
        let o = p.add_tensor(&f32_tensor("o", TensorRole::AppRead, &[2])).unwrap();
        let err = p.add_node(&node("Softmax", &[a], o)).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_output_shape_checked_on_add() {
        let mut p = Program::new("g");
        let a = p.add_tensor(&f32_tensor("a", TensorRole::AppWrite, &[2, 3])).unwrap();
        let b = p.add_tensor(&f32_tensor("b", TensorRole::AppWrite, &[2, 3])).unwrap();
        let o = p.add_tensor(&f32_tensor("o", TensorRole::AppRead, &[3, 2])).unwrap();
        assert!(p.add_node(&node("ElementWiseAdd", &[a, b], o)).is_err());
    }

    #[test]
    fn test_matmul_then_transpose() {
        let mut p = Program::new("mm");
        let a = p.add_tensor(&f32_tensor("a", TensorRole::AppWrite, &[2, 2])).unwrap();
        let b = p.add_tensor(&f32_tensor("b", TensorRole::AppWrite, &[3, 2])).unwrap();
        let mid = p.add_tensor(&f32_tensor("mid", TensorRole::Native, &[2, 3])).unwrap();
        let out = p.add_tensor(&f32_tensor("out", TensorRole::AppRead, &[3, 2])).unwrap();
        let perm = p.add_tensor(&TensorDesc::static_u32("perm", &[1, 0])).unwrap();

        let mut mm = node("MatMul", &[a, b], mid);
        mm.params.push(NodeParam::new("transpose_in1", ParamValue::Bool(true)));
        p.add_node(&mm).unwrap();
        let mut tr = node("Transpose", &[mid], out);
        tr.params.push(NodeParam::new("perm", ParamValue::Tensor(perm)));
        p.add_node(&tr).unwrap();
        p.validate().unwrap();

        let result = p
            .run(
                &HostKernels,
                vec![
                    (a, vec![1.0, 2.0, 3.0, 4.0]),
                    (b, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
                ],
                &[out],
            )
            .unwrap();
        // a·bᵀ = [[1,2,3],[3,4,7]], transposed.
        assert_eq!(result[0], vec![1.0, 3.0, 2.0, 4.0, 3.0, 7.0]);
    }

    #[test]
    fn test_validate_requires_outputs_written() {
        let mut p = Program::new("g");
        p.add_tensor(&f32_tensor("o", TensorRole::AppRead, &[2])).unwrap();
        assert!(p.validate().is_err());
    }
}
