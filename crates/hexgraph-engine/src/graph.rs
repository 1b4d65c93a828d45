//! Graph templates and the builder that records them on an accelerator.

use hexgraph_core::{
    AccelDType, Accelerator, ApiStatus, ContextId, GraphId, HexError, MemHandle, NodeParam, OpKind,
    ParamValue, Result, TensorDesc, TensorId, TensorMeta, TensorRole,
};

use crate::adapter::{to_accelerator_tensor, AccelTensor};
use crate::cache::GraphKey;
use crate::memory::SharedBuffer;
use crate::ops::{
    OpCapability, MATMUL_TRANSPOSE_IN1, OP_MATMUL, OP_RESHAPE, OP_TILE, OP_TRANSPOSE, PARAM_MULTIPLES,
    PARAM_PERM,
};

/// Graph shape used for an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Template {
    /// One node over the table's declared inputs.
    Elementwise,
    /// MatMul followed by a transpose to the host layout (rank 2/3).
    MatMul,
    /// Reshape/tile/transpose chain around a rank-3 MatMul, used for rank-4
    /// operands and for batch broadcast.
    BatchedMatMul,
}

impl Template {
    pub fn select(op: OpKind, srcs: &[TensorMeta], dst: &TensorMeta) -> Self {
        match op {
            OpKind::MulMat => {
                if dst.shape.rank() == 4 || srcs[0].shape.batch() != srcs[1].shape.batch() {
                    Template::BatchedMatMul
                } else {
                    Template::MatMul
                }
            }
            _ => Template::Elementwise,
        }
    }

    /// Structural tag appended to the op name in the graph key.
    pub fn tag(self) -> &'static str {
        match self {
            Template::Elementwise | Template::MatMul => "",
            Template::BatchedMatMul => "_4d",
        }
    }
}

/// Output axis permutation of the matmul templates, by accelerator rank.
pub fn output_perm(rank: usize) -> &'static [u32] {
    match rank {
        2 => &[1, 0],
        3 => &[0, 2, 1],
        4 => &[0, 1, 3, 2],
        _ => panic!("no matmul output permutation for rank {rank}"),
    }
}

/// How many times operand A is repeated along the batch axis.
pub fn tile_factor(a_batch: usize, b_batch: usize) -> usize {
    assert!(
        a_batch > 0 && b_batch % a_batch == 0,
        "batch {b_batch} is not a multiple of {a_batch}"
    );
    b_batch / a_batch
}

/// A graph input or output and the descriptor it was created from.
#[derive(Debug, Clone)]
pub struct GraphPort {
    pub id: TensorId,
    pub tensor: AccelTensor,
}

/// Registered shared buffer standing in for a port on the RPC path.
#[derive(Debug, Clone, Copy)]
pub struct SharedSlot {
    pub buffer: SharedBuffer,
    pub mem: MemHandle,
}

/// A finalized accelerator graph and its tensor handles.
#[derive(Debug)]
pub struct CachedGraph {
    pub graph: GraphId,
    pub template: Template,
    pub inputs: Vec<GraphPort>,
    pub output: GraphPort,
    /// Every tensor, in creation order.
    pub tensors: Vec<TensorId>,
    pub tile_factor: Option<usize>,
    /// Input slots followed by the output slot. Empty off the RPC path.
    pub shared: Vec<SharedSlot>,
    pub runs: u64,
}

impl CachedGraph {
    #[cfg(test)]
    pub(crate) fn empty_for_test(graph: GraphId) -> Self {
        let desc = TensorDesc::new("t", TensorRole::AppRead, AccelDType::Float32, vec![1]);
        Self {
            graph,
            template: Template::Elementwise,
            inputs: Vec::new(),
            output: GraphPort {
                id: TensorId(1),
                tensor: AccelTensor {
                    desc,
                    host_dtype: hexgraph_core::DType::F32,
                    staged: false,
                    needs_transpose: false,
                },
            },
            tensors: Vec::new(),
            tile_factor: None,
            shared: Vec::new(),
            runs: 0,
        }
    }
}

/// Records tensors and nodes into one accelerator graph.
///
/// `finalize` consumes the builder, so no node can be added afterwards. A
/// builder dropped before finalize destroys its half-built graph.
pub struct GraphBuilder<'a> {
    accel: &'a dyn Accelerator,
    graph: GraphId,
    name: String,
    tensors: Vec<TensorId>,
    nodes: usize,
    finalized: bool,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(accel: &'a dyn Accelerator, ctx: ContextId, name: &str) -> Result<Self> {
        let graph = accel.create_graph(ctx, name)?;
        Ok(Self {
            accel,
            graph,
            name: name.to_string(),
            tensors: Vec::new(),
            nodes: 0,
            finalized: false,
        })
    }

    pub fn tensor(&mut self, desc: &TensorDesc) -> Result<TensorId> {
        let id = self.accel.create_tensor(self.graph, desc)?;
        self.tensors.push(id);
        Ok(id)
    }

    /// Create a Native Float32 intermediate.
    pub fn intermediate(&mut self, suffix: &str, dims: Vec<u32>) -> Result<TensorId> {
        let desc = TensorDesc::new(
            format!("{}_{suffix}", self.name),
            TensorRole::Native,
            AccelDType::Float32,
            dims,
        );
        self.tensor(&desc)
    }

    /// Create a static UInt32 constant.
    pub fn constant(&mut self, suffix: &str, values: &[u32]) -> Result<TensorId> {
        self.tensor(&TensorDesc::static_u32(format!("{}_{suffix}", self.name), values))
    }

    pub fn node(&mut self, op_type: &str, params: Vec<NodeParam>, inputs: &[TensorId], output: TensorId) -> Result<()> {
        let node = hexgraph_core::OpNode {
            name: format!("{}_{}_{}", self.name, op_type.to_lowercase(), self.nodes),
            op_type: op_type.to_string(),
            params,
            inputs: inputs.to_vec(),
            outputs: vec![output],
        };
        match self.accel.add_node(self.graph, &node) {
            Err(HexError::Accelerator {
                status: ApiStatus::InvalidState,
                ..
            }) => panic!("node {} added to finalized graph {}", node.name, self.name),
            other => other?,
        }
        self.nodes += 1;
        Ok(())
    }

    pub fn finalize(mut self) -> Result<(GraphId, Vec<TensorId>)> {
        self.accel.finalize_graph(self.graph)?;
        self.finalized = true;
        tracing::debug!(graph = %self.name, tensors = self.tensors.len(), nodes = self.nodes, "graph finalized");
        Ok((self.graph, std::mem::take(&mut self.tensors)))
    }
}

impl Drop for GraphBuilder<'_> {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(e) = self.accel.destroy_graph(self.graph) {
                tracing::warn!(graph = %self.name, error = %e, "failed to destroy abandoned graph");
            }
        }
    }
}

fn port(builder: &mut GraphBuilder<'_>, tensor: AccelTensor) -> Result<GraphPort> {
    let id = builder.tensor(&tensor.desc)?;
    Ok(GraphPort { id, tensor })
}

fn max_rank(srcs: &[TensorMeta], dst: &TensorMeta) -> usize {
    srcs.iter().map(|m| m.shape.rank()).chain(std::iter::once(dst.shape.rank())).max().unwrap_or(1)
}

/// Build and finalize the graph for one op signature.
pub fn build_graph(
    accel: &dyn Accelerator,
    ctx: ContextId,
    key: &GraphKey,
    cap: &OpCapability,
    template: Template,
    srcs: &[TensorMeta],
    dst: &TensorMeta,
) -> Result<CachedGraph> {
    assert_eq!(srcs.len(), cap.input_count, "{key}: wrong source count for {}", cap.op_name);
    let mut builder = GraphBuilder::new(accel, ctx, key.as_str())?;
    let (inputs, output, tile) = match template {
        Template::Elementwise => elementwise(&mut builder, key, cap, srcs, dst)?,
        Template::MatMul => matmul(&mut builder, key, cap, srcs, dst)?,
        Template::BatchedMatMul => batched_matmul(&mut builder, key, srcs, dst)?,
    };
    let (graph, tensors) = builder.finalize()?;
    Ok(CachedGraph {
        graph,
        template,
        inputs,
        output,
        tensors,
        tile_factor: tile,
        shared: Vec::new(),
        runs: 0,
    })
}

type Ports = (Vec<GraphPort>, GraphPort, Option<usize>);

fn elementwise(
    b: &mut GraphBuilder<'_>,
    key: &GraphKey,
    cap: &OpCapability,
    srcs: &[TensorMeta],
    dst: &TensorMeta,
) -> Result<Ports> {
    let rank = max_rank(srcs, dst);
    let mut inputs = Vec::with_capacity(srcs.len());
    for (i, meta) in srcs.iter().enumerate() {
        let t = to_accelerator_tensor(format!("{key}_src{i}"), meta, TensorRole::AppWrite, None, Some(rank), false)?;
        inputs.push(port(b, t)?);
    }
    let out = to_accelerator_tensor(
        format!("{key}_dst"),
        dst,
        TensorRole::AppRead,
        Some(AccelDType::Float32),
        Some(rank),
        false,
    )?;
    let output = port(b, out)?;
    let ids: Vec<TensorId> = inputs.iter().map(|p| p.id).collect();
    b.node(cap.op_name, Vec::new(), &ids, output.id)?;
    Ok((inputs, output, None))
}

fn matmul_operands(
    b: &mut GraphBuilder<'_>,
    key: &GraphKey,
    srcs: &[TensorMeta],
    dst: &TensorMeta,
    rank: usize,
) -> Result<(Vec<GraphPort>, GraphPort)> {
    let (a, w) = (&srcs[0], &srcs[1]);
    assert_eq!(a.shape.ne()[0], w.shape.ne()[0], "{key}: matmul inner dimension mismatch");
    let f32 = Some(AccelDType::Float32);
    let a = to_accelerator_tensor(format!("{key}_src0"), a, TensorRole::AppWrite, f32, Some(rank), false)?;
    let w = to_accelerator_tensor(format!("{key}_src1"), w, TensorRole::AppWrite, f32, Some(rank), false)?;
    let out = to_accelerator_tensor(format!("{key}_dst"), dst, TensorRole::AppRead, f32, Some(rank), false)?;
    let inputs = vec![port(b, a)?, port(b, w)?];
    let output = port(b, out)?;
    Ok((inputs, output))
}

fn matmul(
    b: &mut GraphBuilder<'_>,
    key: &GraphKey,
    cap: &OpCapability,
    srcs: &[TensorMeta],
    dst: &TensorMeta,
) -> Result<Ports> {
    let rank = max_rank(srcs, dst);
    let (inputs, output) = matmul_operands(b, key, srcs, dst, rank)?;

    // MatMul yields [.., M, N]; the host wants [.., N, M].
    let mm = to_accelerator_tensor(
        format!("{key}_mm"),
        dst,
        TensorRole::Native,
        Some(AccelDType::Float32),
        Some(rank),
        true,
    )?;
    let mm_id = b.tensor(&mm.desc)?;
    let perm = b.constant("perm", output_perm(rank))?;

    let param = cap.param.unwrap_or(MATMUL_TRANSPOSE_IN1);
    b.node(
        cap.op_name,
        vec![NodeParam::new(param, ParamValue::Bool(true))],
        &[inputs[0].id, inputs[1].id],
        mm_id,
    )?;
    b.node(
        OP_TRANSPOSE,
        vec![NodeParam::new(PARAM_PERM, ParamValue::Tensor(perm))],
        &[mm_id],
        output.id,
    )?;
    Ok((inputs, output, None))
}

fn batched_matmul(b: &mut GraphBuilder<'_>, key: &GraphKey, srcs: &[TensorMeta], dst: &TensorMeta) -> Result<Ports> {
    let (inputs, output) = matmul_operands(b, key, srcs, dst, 4)?;

    let [k, m, a2, a3] = srcs[0].shape.ne();
    let [_, n, b2, b3] = srcs[1].shape.ne();
    assert_eq!(dst.shape.ne(), [m, n, b2, b3], "{key}: destination shape mismatch");
    let (a_batch, b_batch) = (a2 * a3, b2 * b3);
    let factor = tile_factor(a_batch, b_batch);
    let d = |v: usize| v as u32;

    // A: [a3, a2, M, K] -> [A_batch, M, K], tiled to [B_batch, M, K].
    let a_flat = b.intermediate("a_flat", vec![d(a_batch), d(m), d(k)])?;
    b.node(OP_RESHAPE, Vec::new(), &[inputs[0].id], a_flat)?;
    let a_ready = if factor > 1 {
        let multiples = b.constant("multiples", &[d(factor), 1, 1])?;
        let a_tiled = b.intermediate("a_tiled", vec![d(b_batch), d(m), d(k)])?;
        b.node(
            OP_TILE,
            vec![NodeParam::new(PARAM_MULTIPLES, ParamValue::Tensor(multiples))],
            &[a_flat],
            a_tiled,
        )?;
        a_tiled
    } else {
        a_flat
    };

    // B: [b3, b2, N, K] -> [b3, b2, K, N] -> [B_batch, K, N].
    let perm = b.constant("perm", output_perm(4))?;
    let b_t = b.intermediate("b_t", vec![d(b3), d(b2), d(k), d(n)])?;
    b.node(
        OP_TRANSPOSE,
        vec![NodeParam::new(PARAM_PERM, ParamValue::Tensor(perm))],
        &[inputs[1].id],
        b_t,
    )?;
    let b_flat = b.intermediate("b_flat", vec![d(b_batch), d(k), d(n)])?;
    b.node(OP_RESHAPE, Vec::new(), &[b_t], b_flat)?;

    let mm = b.intermediate("mm", vec![d(b_batch), d(m), d(n)])?;
    b.node(OP_MATMUL, Vec::new(), &[a_ready, b_flat], mm)?;
    let mm4 = b.intermediate("mm4", vec![d(b3), d(b2), d(m), d(n)])?;
    b.node(OP_RESHAPE, Vec::new(), &[mm], mm4)?;
    b.node(
        OP_TRANSPOSE,
        vec![NodeParam::new(PARAM_PERM, ParamValue::Tensor(perm))],
        &[mm4],
        output.id,
    )?;
    Ok((inputs, output, Some(factor)))
}
