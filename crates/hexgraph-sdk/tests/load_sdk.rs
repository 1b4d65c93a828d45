//! Integration test: verify the SDK shim loads and a context can be created.

use std::path::PathBuf;
use std::sync::Arc;

use hexgraph_core::{Accelerator, ContextParams, PerfProfile};

fn sdk_path() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var("HEXSDK_LIB").ok()?);
    path.exists().then_some(path)
}

#[test]
fn test_load_npu_sdk() {
    let Some(path) = sdk_path() else {
        eprintln!("Skipping: HEXSDK_LIB not set or library missing");
        return;
    };

    let lib = unsafe { libloading::Library::new(&path) }.expect("failed to load SDK shim");
    let sdk = hexgraph_sdk::NpuSdk::new("npu", Arc::new(lib), None).expect("symbol resolution");

    let ctx = sdk
        .create_context(&ContextParams {
            device: 2,
            profile: PerfProfile::HighPerformance,
            thread_count: 4,
            vtcm_mb: 8,
        })
        .expect("failed to create context");
    let graph = sdk.create_graph(ctx, "smoke").expect("failed to create graph");
    sdk.destroy_graph(graph).expect("failed to free graph");
    sdk.destroy_context(ctx).expect("failed to free context");
}
