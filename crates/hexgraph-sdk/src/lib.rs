pub mod convert;
pub mod rpcmem;
pub mod runtime;

pub use rpcmem::RpcMemAllocator;
pub use runtime::NpuSdk;
