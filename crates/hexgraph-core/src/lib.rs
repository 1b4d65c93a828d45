pub mod accel;
pub mod error;
pub mod quant;
pub mod traits;
pub mod types;

pub use accel::*;
pub use error::{HexError, Result};
pub use quant::{quantize_q8_0, BlockDequantizer, Dequantizer};
pub use traits::{Accelerator, SharedAllocator};
pub use types::*;
