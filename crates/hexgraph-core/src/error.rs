use thiserror::Error;

use crate::accel::ApiStatus;

/// Top-level error type for the hexgraph offload engine.
#[derive(Debug, Error)]
pub enum HexError {
    /// The backend cannot offload this op, rank or element type. Callers
    /// should fall back to another backend; never retried.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("shared memory pool exhausted: requested {requested} bytes, available {available} bytes")]
    PoolExhausted { requested: usize, available: usize },

    #[error("device {device} already has a live execution context")]
    AlreadyInitialized { device: u32 },

    #[error("backend is not initialized")]
    NotInitialized,

    #[error("resource error: {0}")]
    Resource(String),

    /// A capability-interface call returned a non-success status.
    #[error("accelerator call `{call}` failed: {status}")]
    Accelerator { call: &'static str, status: ApiStatus },

    #[error("library load error: {0}")]
    Library(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HexError {
    pub fn accelerator(call: &'static str, status: ApiStatus) -> Self {
        Self::Accelerator { call, status }
    }

    /// True when the error means "this backend cannot handle the op",
    /// either from our own tables or from the accelerator itself.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            HexError::Unsupported(_)
                | HexError::Accelerator {
                    status: ApiStatus::NotSupported,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, HexError>;
