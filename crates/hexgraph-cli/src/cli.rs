use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rand::{Rng, SeedableRng};
use serde::Serialize;

use hexgraph_core::{DType, HostTensor, OpDispatch, OpKind, Shape};
use hexgraph_engine::{devices, nmse, reference_compute, CacheStats, DispatchStats, OffloadBackend};

#[derive(Parser)]
#[command(name = "hexgraph", about = "Offload tensor ops to accelerators through cached graphs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a backend config file (JSON).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the device table.
    Devices {
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
    /// Run one op on random data and check it against the host reference.
    Run {
        #[arg(long, value_enum)]
        op: OpArg,
        /// Device to offload to; overrides the config file.
        #[arg(long)]
        device: Option<hexgraph_engine::DeviceKind>,
        /// Host extents, innermost first (e.g. 64x32). For mul-mat this is
        /// the first operand, K x M x batch.
        #[arg(long, default_value = "64x32")]
        shape: String,
        /// Rows of the second mul-mat operand.
        #[arg(long, default_value = "16")]
        n: usize,
        /// Repeat the second operand's batch this many times (mul-mat only).
        #[arg(long, default_value = "1")]
        broadcast: usize,
        #[arg(long, default_value = "1")]
        iterations: usize,
        #[arg(long, default_value = "0")]
        seed: u64,
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OpArg {
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
    Log,
    MulMat,
}

impl From<OpArg> for OpKind {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::Add => OpKind::Add,
            OpArg::Sub => OpKind::Sub,
            OpArg::Mul => OpKind::Mul,
            OpArg::Div => OpKind::Div,
            OpArg::Sqrt => OpKind::Sqrt,
            OpArg::Log => OpKind::Log,
            OpArg::MulMat => OpKind::MulMat,
        }
    }
}

pub fn print_devices(format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => {
            for info in devices() {
                let accepted: Vec<&str> = info.accepted.iter().map(|d| d.name()).collect();
                println!(
                    "{:<5} {:<34} lib={:<18} types={:<14} rpc={}",
                    info.name,
                    info.description,
                    info.default_library.unwrap_or("-"),
                    accepted.join(","),
                    info.rpc_fast_path
                );
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(devices())?),
    }
    Ok(())
}

/// Parse `64x32x2` into host extents.
pub fn parse_shape(text: &str) -> anyhow::Result<Vec<usize>> {
    let dims = text
        .split('x')
        .map(|d| d.trim().parse::<usize>().with_context(|| format!("bad extent `{d}` in `{text}`")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Shape::new(&dims)?;
    Ok(dims)
}

/// Source and destination extents for `op` given the first operand.
pub fn operand_shapes(op: OpKind, shape: &[usize], n: usize, broadcast: usize) -> anyhow::Result<(Vec<Vec<usize>>, Vec<usize>)> {
    match op {
        OpKind::Sqrt | OpKind::Log => Ok((vec![shape.to_vec()], shape.to_vec())),
        OpKind::MulMat => {
            if shape.len() < 2 {
                bail!("mul-mat needs at least K x M");
            }
            if broadcast == 0 {
                bail!("--broadcast must be at least 1");
            }
            let mut b = shape.to_vec();
            b[1] = n;
            if broadcast > 1 {
                if b.len() == 2 {
                    b.push(1);
                }
                b[2] *= broadcast;
            }
            let mut a = shape.to_vec();
            a.resize(b.len(), 1);
            let mut dst = b.clone();
            dst[0] = a[1];
            Ok((vec![a, b], dst))
        }
        _ => Ok((vec![shape.to_vec(), shape.to_vec()], shape.to_vec())),
    }
}

#[derive(Serialize)]
struct RunReport {
    op: &'static str,
    device: &'static str,
    backend: String,
    rpc_path: bool,
    dst: Vec<usize>,
    iterations: usize,
    first_ms: f64,
    mean_ms: f64,
    nmse: f64,
    cache: CacheStats,
    dispatch: DispatchStats,
}

fn random_tensor(dims: &[usize], rng: &mut rand::rngs::StdRng, positive: bool) -> anyhow::Result<HostTensor> {
    let n: usize = dims.iter().product();
    let lo = if positive { 0.1f32 } else { -1.0 };
    let values: Vec<f32> = (0..n).map(|_| rng.gen_range(lo..=1.0)).collect();
    Ok(HostTensor::from_f32(dims, &values)?)
}

#[allow(clippy::too_many_arguments)]
pub fn run_op(
    backend: &OffloadBackend,
    op: OpKind,
    shape: &[usize],
    n: usize,
    broadcast: usize,
    iterations: usize,
    seed: u64,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let (src_dims, dst_dims) = operand_shapes(op, shape, n, broadcast)?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    // Sqrt, log and div need positive inputs to stay finite.
    let positive = matches!(op, OpKind::Sqrt | OpKind::Log | OpKind::Div);
    let srcs = src_dims
        .iter()
        .map(|d| random_tensor(d, &mut rng, positive))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut dst = HostTensor::zeros(DType::F32, &dst_dims)?;

    let mut timings = Vec::with_capacity(iterations.max(1));
    for _ in 0..iterations.max(1) {
        let views = srcs.iter().map(|t| t.view()).collect();
        let mut dispatch = OpDispatch::new(op, views, dst.view_mut());
        let started = Instant::now();
        backend
            .compute(&mut dispatch)
            .with_context(|| format!("{op} on {}", backend.device().name))?;
        timings.push(started.elapsed().as_secs_f64() * 1000.0);
    }

    let views: Vec<_> = srcs.iter().map(|t| t.view()).collect();
    let expected = reference_compute(op, &views, &dst.shape())?;
    let report = RunReport {
        op: op.name(),
        device: backend.device().name,
        backend: backend.accelerator().name().to_string(),
        rpc_path: backend.rpc_path(),
        dst: dst_dims,
        iterations: timings.len(),
        first_ms: timings[0],
        mean_ms: timings.iter().sum::<f64>() / timings.len() as f64,
        nmse: nmse(&expected, &dst.to_f32_vec()?),
        cache: backend.cache_stats(),
        dispatch: backend.dispatch_stats(),
    };

    match format {
        OutputFormat::Text => {
            println!(
                "{} on {} ({}) -> {:?}: nmse {:.3e}",
                report.op, report.device, report.backend, report.dst, report.nmse
            );
            eprintln!(
                "[{} runs | first:{:.2}ms mean:{:.2}ms | cache hits:{} builds:{}]",
                report.iterations, report.first_ms, report.mean_ms, report.cache.hits, report.cache.builds
            );
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shape() {
        assert_eq!(parse_shape("64x32").unwrap(), vec![64, 32]);
        assert!(parse_shape("64xa").is_err());
        assert!(parse_shape("1x1x1x1x1").is_err());
    }

    #[test]
    fn test_matmul_shapes_with_broadcast() {
        let (srcs, dst) = operand_shapes(OpKind::MulMat, &[64, 8, 3], 5, 2).unwrap();
        assert_eq!(srcs[0], vec![64, 8, 3]);
        assert_eq!(srcs[1], vec![64, 5, 6]);
        assert_eq!(dst, vec![8, 5, 6]);
    }

    #[test]
    fn test_matmul_broadcast_from_rank2() {
        let (srcs, dst) = operand_shapes(OpKind::MulMat, &[16, 4], 2, 3).unwrap();
        assert_eq!(srcs[0], vec![16, 4, 1]);
        assert_eq!(srcs[1], vec![16, 2, 3]);
        assert_eq!(dst, vec![4, 2, 3]);
    }

    #[test]
    fn test_unary_shapes() {
        let (srcs, dst) = operand_shapes(OpKind::Sqrt, &[7, 3], 0, 1).unwrap();
        assert_eq!(srcs.len(), 1);
        assert_eq!(dst, vec![7, 3]);
    }
}
