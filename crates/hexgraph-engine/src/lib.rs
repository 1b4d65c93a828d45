//! Graph-offload engine: turns host tensor ops into cached accelerator
//! graphs and runs them through an [`Accelerator`](hexgraph_core::Accelerator).

pub mod adapter;
pub mod backend;
pub mod cache;
pub mod config;
pub mod device;
pub mod graph;
pub mod memory;
pub mod ops;
pub mod reference;
pub mod registry;
pub mod resource;

pub use backend::{DispatchStats, OffloadBackend};
pub use cache::{CacheStats, GraphCache, GraphKey};
pub use config::BackendConfig;
pub use device::{devices, DeviceInfo, DeviceKind};
pub use graph::Template;
pub use memory::{HostAllocator, SharedMemoryPool};
pub use ops::OpCapability;
pub use reference::{nmse, reference_compute};
pub use registry::{LibraryRegistry, SdkLibraries};
pub use resource::ResourceManager;
