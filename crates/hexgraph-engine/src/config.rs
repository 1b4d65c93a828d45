use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use hexgraph_core::{ContextParams, HexError, PerfProfile, Result};

use crate::device::DeviceKind;

/// Runtime configuration for one offload backend.
///
/// Consumed once when the backend is opened; nothing here is re-read during
/// dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Offload target.
    pub device: DeviceKind,
    /// Overrides the device table's default library.
    pub library_path: Option<PathBuf>,
    /// Power/performance profile requested at context creation.
    pub profile: PerfProfile,
    /// Worker thread hint passed to the accelerator context.
    pub thread_count: u32,
    /// Scratch-memory (VTCM) size hint in MB. 0 = accelerator default.
    pub vtcm_mb: u32,
    /// Soft capacity of the shared-memory pool in MB.
    pub pool_capacity_mb: usize,
    /// Copy through registered shared buffers instead of binding host
    /// pointers. Only honored on devices that offer the fast path.
    pub enable_rpc_path: bool,
    /// Maximum cached graphs. None = never evict.
    pub graph_cache_capacity: Option<NonZeroUsize>,
    /// Ops whose destination has fewer elements stay on the host runtime.
    pub min_offload_elements: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Npu,
            library_path: None,
            profile: PerfProfile::HighPerformance,
            thread_count: 4,
            vtcm_mb: 8,
            pool_capacity_mb: 256,
            enable_rpc_path: false,
            graph_cache_capacity: None,
            min_offload_elements: 0,
        }
    }
}

impl BackendConfig {
    /// NPU through the vendor SDK.
    pub fn npu() -> Self {
        Self::default()
    }

    /// Direct coprocessor kernels.
    pub fn dsp() -> Self {
        Self {
            device: DeviceKind::Dsp,
            vtcm_mb: 0,
            pool_capacity_mb: 128,
            ..Self::default()
        }
    }

    /// In-process kernels; needs no vendor libraries.
    pub fn host() -> Self {
        Self {
            device: DeviceKind::Host,
            thread_count: 1,
            vtcm_mb: 0,
            pool_capacity_mb: 64,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), device = %config.device, "loaded backend config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity_mb == 0 {
            return Err(HexError::InvalidConfig("pool_capacity_mb must be > 0".into()));
        }
        if self.thread_count == 0 {
            return Err(HexError::InvalidConfig("thread_count must be > 0".into()));
        }
        if self.device == DeviceKind::Host && self.library_path.is_some() {
            return Err(HexError::InvalidConfig(
                "the host device loads no library; remove library_path".into(),
            ));
        }
        if self.enable_rpc_path && !self.device.info().rpc_fast_path {
            tracing::warn!(device = %self.device, "RPC fast path requested but not offered; ignoring");
        }
        Ok(())
    }

    /// Library to load for the configured device, if any.
    pub fn library(&self) -> Option<PathBuf> {
        self.library_path
            .clone()
            .or_else(|| self.device.info().default_library.map(PathBuf::from))
    }

    pub fn pool_capacity_bytes(&self) -> usize {
        self.pool_capacity_mb * 1024 * 1024
    }

    /// The RPC path is used only when both the device and the config allow it.
    pub fn rpc_path_active(&self) -> bool {
        self.enable_rpc_path && self.device.info().rpc_fast_path
    }

    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            device: self.device.id(),
            profile: self.profile,
            thread_count: self.thread_count,
            vtcm_mb: self.vtcm_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for config in [BackendConfig::npu(), BackendConfig::dsp(), BackendConfig::host()] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_rejects_zero_pool() {
        let config = BackendConfig {
            pool_capacity_mb: 0,
            ..BackendConfig::host()
        };
        assert!(matches!(config.validate(), Err(HexError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_library_for_host() {
        let config = BackendConfig {
            library_path: Some("libfoo.so".into()),
            ..BackendConfig::host()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_library_defaults_from_device_table() {
        assert_eq!(BackendConfig::npu().library(), Some(PathBuf::from("libhexsdk_npu.so")));
        assert_eq!(BackendConfig::host().library(), None);
        let custom = BackendConfig {
            library_path: Some("/opt/sdk/libhexsdk_npu.so".into()),
            ..BackendConfig::npu()
        };
        assert_eq!(custom.library(), Some(PathBuf::from("/opt/sdk/libhexsdk_npu.so")));
    }

    #[test]
    fn test_rpc_path_needs_device_support() {
        let dsp = BackendConfig {
            enable_rpc_path: true,
            ..BackendConfig::dsp()
        };
        assert!(!dsp.rpc_path_active());
        let npu = BackendConfig {
            enable_rpc_path: true,
            ..BackendConfig::npu()
        };
        assert!(npu.rpc_path_active());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"device":"dsp","graph_cache_capacity":8}"#).unwrap();
        assert_eq!(config.device, DeviceKind::Dsp);
        assert_eq!(config.graph_cache_capacity, NonZeroUsize::new(8));
        assert_eq!(config.pool_capacity_mb, 256);
    }
}
