//! Device context: selection, activation, exclusive ownership.

use tracing::{info, warn};

use crate::device::{
    hardware_only, select_device, DeviceDescriptor, EmptyDataset, HardwareDevice, MergeConfig,
};
use crate::MergeResult;

#[cfg(not(feature = "cuda"))]
use crate::MergeError;

/// Minimum compute capability; older devices are used with a warning.
const MIN_COMPUTE_CAPABILITY: (u32, u32) = (5, 0);

/// The active connection to one selected accelerator.
///
/// Owns the device exclusively; buffers and kernels allocated through it are
/// released before the context is dropped.
pub struct DeviceContext {
    device: Box<dyn HardwareDevice>,
}

impl DeviceContext {
    /// Enumerate, filter, select, and start a hardware device.
    ///
    /// `Ok(None)` when hardware merging is disabled or no hardware device
    /// exists; that is the expected host-only mode, not an error.
    pub fn build(config: &MergeConfig) -> MergeResult<Option<Self>> {
        if config.disabled {
            return Ok(None);
        }
        info!("film hardware sample merging");

        let descs = hardware_only(Self::enumerate());
        let Some(index) = select_device(&descs, config.device_index) else {
            info!("no hardware device available, sample merging stays on the host");
            return Ok(None);
        };
        let desc = &descs[index];
        info!(
            "film hardware device used: {} (type: {})",
            desc.name,
            desc.kind.label()
        );
        if let Some((major, minor)) = desc.compute_capability {
            info!("  device compute capability: {major}.{minor}");
            if (major, minor) < MIN_COMPUTE_CAPABILITY {
                warn!(
                    "compute capability {}.{} or better is required, device {} may not work",
                    MIN_COMPUTE_CAPABILITY.0, MIN_COMPUTE_CAPABILITY.1, desc.name
                );
            }
        }

        Self::from_device(Self::open(desc)?).map(Some)
    }

    /// Wrap an already-open device, attaching the dataset and starting it.
    pub fn from_device(mut device: Box<dyn HardwareDevice>) -> MergeResult<Self> {
        // The platform refuses to start without a dataset, even a trivial one.
        let mut dataset = EmptyDataset::new();
        dataset.preprocess();
        device.start(dataset)?;
        Ok(Self { device })
    }

    fn enumerate() -> Vec<DeviceDescriptor> {
        #[allow(unused_mut)]
        let mut descs: Vec<DeviceDescriptor> = Vec::new();
        #[cfg(feature = "cuda")]
        descs.extend(crate::device::CudaDevice::enumerate());
        descs
    }

    fn open(desc: &DeviceDescriptor) -> MergeResult<Box<dyn HardwareDevice>> {
        match desc.kind {
            #[cfg(feature = "cuda")]
            crate::device::DeviceKind::CudaGpu => {
                Ok(Box::new(crate::device::CudaDevice::open(desc.ordinal)?))
            }
            #[cfg(not(feature = "cuda"))]
            kind => Err(MergeError::DeviceCreation(format!(
                "no compiled-in platform can open a {} device",
                kind.label()
            ))),
            #[cfg(feature = "cuda")]
            kind => Err(crate::MergeError::DeviceCreation(format!(
                "no compiled-in platform can open a {} device",
                kind.label()
            ))),
        }
    }

    pub fn device(&self) -> &dyn HardwareDevice {
        &*self.device
    }

    pub fn device_mut(&mut self) -> &mut dyn HardwareDevice {
        &mut *self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;

    #[test]
    fn test_disabled_config_builds_nothing() {
        let config = MergeConfig {
            disabled: true,
            device_index: None,
        };
        assert!(DeviceContext::build(&config).unwrap().is_none());
    }

    #[test]
    fn test_from_device_starts_it() {
        let ctx = DeviceContext::from_device(Box::new(SoftwareDevice::new())).unwrap();
        assert_eq!(ctx.device().used_memory(), 0);
    }
}
