//! Device selection policy and merge configuration.

use std::env;

use super::{DeviceDescriptor, DeviceKind};

/// Hardware-merge configuration.
///
/// # Environment Variables
///
/// - `EMBER_HW_DISABLE` - disable hardware merging ("1" or "true")
/// - `EMBER_HW_DEVICE` - pin a device index within the hardware list
#[derive(Debug, Clone, Default)]
pub struct MergeConfig {
    /// Disable hardware merging entirely.
    pub disabled: bool,
    /// Pin a specific device index; out-of-range values fall back to the scan.
    pub device_index: Option<usize>,
}

impl MergeConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = env::var("EMBER_HW_DISABLE") {
            config.disabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("EMBER_HW_DEVICE") {
            config.device_index = v.parse().ok();
        }
        config
    }
}

/// Drop every descriptor selection may not consider.
pub fn hardware_only(mut descs: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    descs.retain(|desc| desc.kind.is_hardware());
    descs
}

/// Pick at most one device from a hardware-filtered descriptor list.
///
/// A pinned in-range index is honored unconditionally. Otherwise the list is
/// scanned in order: the first CUDA GPU wins immediately; failing that, the
/// first other GPU seen is used. `None` means merging stays on the host.
pub fn select_device(descs: &[DeviceDescriptor], pinned: Option<usize>) -> Option<usize> {
    if let Some(index) = pinned {
        if index < descs.len() {
            return Some(index);
        }
    }

    let mut candidate = None;
    for (i, desc) in descs.iter().enumerate() {
        match desc.kind {
            DeviceKind::CudaGpu => return Some(i),
            // Keep the first match but continue scanning: a CUDA device
            // further down the list still takes precedence.
            DeviceKind::GenericGpu if candidate.is_none() => candidate = Some(i),
            _ => {}
        }
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(kind: DeviceKind, ordinal: usize) -> DeviceDescriptor {
        DeviceDescriptor {
            kind,
            name: format!("{} {}", kind.label(), ordinal),
            compute_capability: None,
            ordinal,
        }
    }

    #[test]
    fn test_empty_list() {
        assert_eq!(select_device(&[], None), None);
        assert_eq!(select_device(&[], Some(0)), None);
    }

    #[test]
    fn test_pinned_index_honored() {
        let descs = vec![
            desc(DeviceKind::CudaGpu, 0),
            desc(DeviceKind::GenericGpu, 1),
        ];
        assert_eq!(select_device(&descs, Some(1)), Some(1));
    }

    #[test]
    fn test_pinned_out_of_range_falls_back() {
        let descs = vec![desc(DeviceKind::GenericGpu, 0)];
        assert_eq!(select_device(&descs, Some(5)), Some(0));
    }

    #[test]
    fn test_cuda_preferred_over_earlier_generic() {
        let descs = vec![
            desc(DeviceKind::GenericGpu, 0),
            desc(DeviceKind::CudaGpu, 1),
        ];
        assert_eq!(select_device(&descs, None), Some(1));
    }

    #[test]
    fn test_first_cuda_wins() {
        let descs = vec![
            desc(DeviceKind::GenericGpu, 0),
            desc(DeviceKind::CudaGpu, 1),
            desc(DeviceKind::CudaGpu, 2),
        ];
        assert_eq!(select_device(&descs, None), Some(1));
    }

    #[test]
    fn test_first_generic_kept() {
        let descs = vec![
            desc(DeviceKind::GenericGpu, 0),
            desc(DeviceKind::GenericGpu, 1),
        ];
        assert_eq!(select_device(&descs, None), Some(0));
    }

    #[test]
    fn test_hardware_filter() {
        let descs = hardware_only(vec![
            desc(DeviceKind::Cpu, 0),
            desc(DeviceKind::GenericGpu, 1),
        ]);
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].kind, DeviceKind::GenericGpu);
        // The software kind never reaches selection.
        assert_eq!(select_device(&hardware_only(vec![desc(DeviceKind::Cpu, 0)]), None), None);
    }
}
