pub mod device;
pub mod kernels;
pub mod program;
pub mod remote;

pub use device::Coprocessor;
pub use kernels::{BinaryOp, HostKernels, KernelOp, KernelRuntime, Operand, OperandMut, UnaryFn};
pub use program::Program;
pub use remote::RemoteKernels;
