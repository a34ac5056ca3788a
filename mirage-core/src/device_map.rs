use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

pub fn select_best_device(device_map: DeviceMap) -> candle_core::Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            debug!("no accelerator available, falling back to cpu");
            Ok(Device::Cpu)
        }
    }
}

/// Half precision on accelerators, full precision on cpu.
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cuda() || device.is_metal() {
        DType::F16
    } else {
        DType::F32
    }
}

/// A short platform string for bug reports and log headers.
pub fn hardware_description(device: &Device) -> String {
    let kind = if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    };
    format!(
        "{}-{} ({kind})",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
