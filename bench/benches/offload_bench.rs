//! Dispatch benchmarks on the in-process device.
//!
//! Run with: cargo bench --bench offload_bench
//!
//! `cache_hit` measures steady-state dispatch of one signature; `cache_miss`
//! resets the context before every call so each dispatch rebuilds its graph.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};

use hexgraph_core::{DType, HostTensor, OpDispatch, OpKind};
use hexgraph_engine::{BackendConfig, OffloadBackend, SdkLibraries};

fn backend() -> OffloadBackend {
    OffloadBackend::open(BackendConfig::host(), Arc::new(SdkLibraries::new())).unwrap()
}

fn random(dims: &[usize], seed: u64) -> HostTensor {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let n: usize = dims.iter().product();
    let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..=1.0)).collect();
    HostTensor::from_f32(dims, &values).unwrap()
}

fn dispatch(backend: &OffloadBackend, op: OpKind, srcs: &[HostTensor], dst: &mut HostTensor) {
    let views = srcs.iter().map(|t| t.view()).collect();
    let mut d = OpDispatch::new(op, views, dst.view_mut());
    backend.compute(&mut d).unwrap();
}

/// (label, op, source extents, destination extents)
type Case = (&'static str, OpKind, Vec<Vec<usize>>, Vec<usize>);

fn cases() -> Vec<Case> {
    vec![
        ("add_256x256", OpKind::Add, vec![vec![256, 256], vec![256, 256]], vec![256, 256]),
        ("mul_mat_256x64x64", OpKind::MulMat, vec![vec![256, 64], vec![256, 64]], vec![64, 64]),
        (
            "mul_mat_bcast_64x16x4",
            OpKind::MulMat,
            vec![vec![64, 16, 2, 2], vec![64, 16, 4, 2]],
            vec![16, 16, 4, 2],
        ),
    ]
}

fn bench_cache_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_hit");
    let backend = backend();
    for (label, op, src_dims, dst_dims) in cases() {
        let srcs: Vec<HostTensor> = src_dims.iter().enumerate().map(|(i, d)| random(d, i as u64)).collect();
        let mut dst = HostTensor::zeros(DType::F32, &dst_dims).unwrap();
        dispatch(&backend, op, &srcs, &mut dst);
        group.bench_with_input(BenchmarkId::new("dispatch", label), &op, |b, &op| {
            b.iter(|| dispatch(&backend, op, &srcs, &mut dst));
        });
    }
    group.finish();
}

fn bench_cache_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_miss");
    group.sample_size(20);
    let backend = backend();
    for (label, op, src_dims, dst_dims) in cases() {
        let srcs: Vec<HostTensor> = src_dims.iter().enumerate().map(|(i, d)| random(d, i as u64)).collect();
        let mut dst = HostTensor::zeros(DType::F32, &dst_dims).unwrap();
        group.bench_with_input(BenchmarkId::new("build+dispatch", label), &op, |b, &op| {
            b.iter(|| {
                backend.reset_context().unwrap();
                dispatch(&backend, op, &srcs, &mut dst);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cache_hit, bench_cache_miss);
criterion_main!(benches);
