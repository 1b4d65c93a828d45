use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use hexgraph_core::{DType, HexError};

/// Remote-memory allocator library backing the RPC fast path.
pub const RPCMEM_LIBRARY: &str = "libcdsprpc.so";

/// Offload targets, identified on the wire by a small integer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
    #[default]
    Npu,
    Dsp,
    Host,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 5] = [
        DeviceKind::Cpu,
        DeviceKind::Gpu,
        DeviceKind::Npu,
        DeviceKind::Dsp,
        DeviceKind::Host,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn info(self) -> &'static DeviceInfo {
        &DEVICES[self as usize]
    }

    /// Reached through the vendor SDK rather than the coprocessor path.
    pub fn uses_sdk(self) -> bool {
        matches!(self, DeviceKind::Cpu | DeviceKind::Gpu | DeviceKind::Npu)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info().name)
    }
}

impl FromStr for DeviceKind {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceKind::ALL
            .into_iter()
            .find(|k| k.info().name.eq_ignore_ascii_case(s))
            .ok_or_else(|| HexError::InvalidConfig(format!("unknown device {s:?}")))
    }
}

/// Static description of one offload target.
#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub name: &'static str,
    pub description: &'static str,
    /// Library loaded when the config does not override it.
    pub default_library: Option<&'static str>,
    /// Host element types the device consumes without staging.
    pub accepted: &'static [DType],
    /// Compute type every result is produced in.
    pub native: DType,
    /// Offers registered shared-memory buffers for input/output transfer.
    pub rpc_fast_path: bool,
}

impl DeviceInfo {
    pub fn accepts(&self, dtype: DType) -> bool {
        self.accepted.contains(&dtype)
    }
}

static DEVICES: [DeviceInfo; 5] = [
    DeviceInfo {
        kind: DeviceKind::Cpu,
        name: "cpu",
        description: "NPU SDK reference CPU backend",
        default_library: Some("libhexsdk_cpu.so"),
        accepted: &[DType::F32, DType::I8, DType::I32],
        native: DType::F32,
        rpc_fast_path: false,
    },
    DeviceInfo {
        kind: DeviceKind::Gpu,
        name: "gpu",
        description: "NPU SDK GPU backend",
        default_library: Some("libhexsdk_gpu.so"),
        accepted: &[DType::F32, DType::F16],
        native: DType::F32,
        rpc_fast_path: false,
    },
    DeviceInfo {
        kind: DeviceKind::Npu,
        name: "npu",
        description: "NPU SDK tensor processor backend",
        default_library: Some("libhexsdk_npu.so"),
        accepted: &[DType::F32, DType::F16, DType::I8],
        native: DType::F32,
        rpc_fast_path: true,
    },
    DeviceInfo {
        kind: DeviceKind::Dsp,
        name: "dsp",
        description: "direct coprocessor kernels",
        default_library: Some("libhexdsp.so"),
        accepted: &[DType::F32],
        native: DType::F32,
        rpc_fast_path: false,
    },
    DeviceInfo {
        kind: DeviceKind::Host,
        name: "host",
        description: "in-process coprocessor kernels",
        default_library: None,
        accepted: &[DType::F32],
        native: DType::F32,
        rpc_fast_path: false,
    },
];

pub fn devices() -> &'static [DeviceInfo] {
    &DEVICES
}
