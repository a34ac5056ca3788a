use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use serde::Serialize;

use crate::device_map::hardware_description;

/// Environment summary attached to bug reports.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub version: &'static str,
    pub os: &'static str,
    pub arch: &'static str,
    pub cuda_available: bool,
    pub metal_available: bool,
    pub hardware: String,
}

pub fn runtime_info() -> RuntimeInfo {
    RuntimeInfo {
        version: crate::VERSION,
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        cuda_available: cuda_is_available(),
        metal_available: metal_is_available(),
        hardware: hardware_description(&Device::Cpu),
    }
}

impl std::fmt::Display for RuntimeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mirage {} on {}/{} (cuda: {}, metal: {})",
            self.version, self.os, self.arch, self.cuda_available, self.metal_available
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_info_carries_the_crate_version() {
        let info = runtime_info();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert!(info.to_string().contains(info.version));
    }
}
