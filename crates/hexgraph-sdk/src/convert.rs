use hexgraph_core::{AccelDType, ApiStatus, HexError, PerfProfile, Result, TensorRole};
use hexgraph_sdk_sys::{
    SdkDataType, SdkStatus, SdkTensorType, SDK_ERROR_GRAPH_FINALIZED, SDK_ERROR_INVALID_HANDLE,
    SDK_ERROR_NOT_SUPPORTED, SDK_SUCCESS,
};

pub fn sdk_dtype(dtype: AccelDType) -> SdkDataType {
    match dtype {
        AccelDType::Float32 => SdkDataType::Float32,
        AccelDType::Float16 => SdkDataType::Float16,
        AccelDType::Int8 => SdkDataType::Int8,
        AccelDType::Int32 => SdkDataType::Int32,
        AccelDType::UInt32 => SdkDataType::UInt32,
        AccelDType::Bool8 => SdkDataType::Bool8,
    }
}

pub fn sdk_tensor_type(role: TensorRole) -> SdkTensorType {
    match role {
        TensorRole::AppWrite => SdkTensorType::AppWrite,
        TensorRole::AppRead => SdkTensorType::AppRead,
        TensorRole::Native => SdkTensorType::Native,
        TensorRole::Static => SdkTensorType::Static,
    }
}

pub fn sdk_perf_profile(profile: PerfProfile) -> i32 {
    match profile {
        PerfProfile::Default => 0,
        PerfProfile::Balanced => 1,
        PerfProfile::HighPerformance => 2,
        PerfProfile::Burst => 3,
    }
}

pub fn api_status(code: SdkStatus) -> ApiStatus {
    match code {
        SDK_ERROR_NOT_SUPPORTED => ApiStatus::NotSupported,
        SDK_ERROR_INVALID_HANDLE => ApiStatus::InvalidHandle,
        SDK_ERROR_GRAPH_FINALIZED => ApiStatus::InvalidState,
        other => ApiStatus::Failure(other),
    }
}

/// Turn an SDK return code into a `Result`, logging failures.
pub fn check(call: &'static str, code: SdkStatus) -> Result<()> {
    if code == SDK_SUCCESS {
        return Ok(());
    }
    let status = api_status(code);
    tracing::warn!(call, code, %status, "SDK call failed");
    Err(HexError::accelerator(call, status))
}
