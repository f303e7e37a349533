//! Compute device and precision selection

use anyhow::{bail, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use tracing::{info, warn};

use crate::config::{DeviceKind, Precision};

/// The device a pipeline runs on, with the label reported by `/health`
pub struct SelectedDevice {
    pub device: Device,
    pub label: String,
}

/// Resolve the configured device kind to a concrete device
pub fn select_device(kind: DeviceKind, ordinal: usize) -> Result<SelectedDevice> {
    match kind {
        DeviceKind::Cpu => Ok(cpu()),
        DeviceKind::Cuda if cuda_is_available() => cuda(ordinal),
        DeviceKind::Metal if metal_is_available() => metal(ordinal),
        DeviceKind::Cuda => bail!("cuda requested but this build has no CUDA support or no GPU"),
        DeviceKind::Metal => bail!("metal requested but this build has no Metal support"),
        DeviceKind::Auto if cuda_is_available() => cuda(ordinal),
        DeviceKind::Auto if metal_is_available() => metal(ordinal),
        DeviceKind::Auto => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                info!("Running on CPU, build with `--features metal` to run on the GPU");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                info!("Running on CPU, build with `--features cuda` to run on the GPU");
            }
            Ok(cpu())
        }
    }
}

fn cpu() -> SelectedDevice {
    SelectedDevice {
        device: Device::Cpu,
        label: "cpu".to_string(),
    }
}

fn cuda(ordinal: usize) -> Result<SelectedDevice> {
    Ok(SelectedDevice {
        device: Device::new_cuda(ordinal)?,
        label: format!("cuda:{}", ordinal),
    })
}

fn metal(ordinal: usize) -> Result<SelectedDevice> {
    Ok(SelectedDevice {
        device: Device::new_metal(ordinal)?,
        label: format!("metal:{}", ordinal),
    })
}

/// Pick the tensor dtype for the requested precision on `device`.
///
/// Half precision kernels are not available for every CPU op, so CPU always runs f32.
pub fn resolve_dtype(precision: Precision, device: &Device) -> DType {
    match (precision, device.is_cpu()) {
        (Precision::F32, _) => DType::F32,
        (precision, true) => {
            warn!(?precision, "Half precision is not supported on CPU, using f32");
            DType::F32
        }
        (Precision::F16, false) => DType::F16,
        (Precision::Bf16, false) => DType::BF16,
    }
}
