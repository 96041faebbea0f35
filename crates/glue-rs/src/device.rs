use std::fmt;

use serde::{Deserialize, Serialize};

use crate::abi::RawDeviceId;

/// Hardware generation targeted by a compilation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Gaudi,
    Greco,
    Gaudi2,
    Gaudi3,
}

impl DeviceClass {
    pub const COUNT: usize = 4;
    pub const ALL: [DeviceClass; Self::COUNT] = [
        DeviceClass::Gaudi,
        DeviceClass::Greco,
        DeviceClass::Gaudi2,
        DeviceClass::Gaudi3,
    ];
    /// ABI value meaning "every device"; only meaningful to registry initialisation.
    pub const RAW_MAX: RawDeviceId = 5;

    /// Dense index for per-device tables.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn raw(self) -> RawDeviceId {
        self.index() as RawDeviceId + 1
    }

    pub fn from_raw(raw: RawDeviceId) -> Option<Self> {
        match raw {
            1 => Some(DeviceClass::Gaudi),
            2 => Some(DeviceClass::Greco),
            3 => Some(DeviceClass::Gaudi2),
            4 => Some(DeviceClass::Gaudi3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Gaudi => "gaudi",
            DeviceClass::Greco => "greco",
            DeviceClass::Gaudi2 => "gaudi2",
            DeviceClass::Gaudi3 => "gaudi3",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|device| device.as_str() == normalized)
    }

    /// Number of TPC engines a kernel may be spread across when the caller does not override it.
    pub fn default_max_available_tpc(self) -> u32 {
        match self {
            DeviceClass::Gaudi => 8,
            DeviceClass::Greco => 8,
            DeviceClass::Gaudi2 => 24,
            DeviceClass::Gaudi3 => 64,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device-generation gated compiler features.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    SmallVlm,
}

impl Feature {
    fn bit(self) -> u32 {
        match self {
            Feature::SmallVlm => 1 << 0,
        }
    }

    /// First generation that supports the feature, in raw device order.
    fn introduced_in(self) -> DeviceClass {
        match self {
            Feature::SmallVlm => DeviceClass::Greco,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FeatureSupport {
    bits: [u32; DeviceClass::COUNT],
}

impl FeatureSupport {
    /// Enables every feature whose first generation is at or before `device`.
    pub(crate) fn derive_for(&mut self, device: DeviceClass) {
        for feature in [Feature::SmallVlm] {
            if device >= feature.introduced_in() {
                self.bits[device.index()] |= feature.bit();
            }
        }
    }

    pub fn is_supported(&self, device: DeviceClass, feature: Feature) -> bool {
        self.bits[device.index()] & feature.bit() != 0
    }

    pub(crate) fn clear(&mut self) {
        self.bits = [0; DeviceClass::COUNT];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_ids_are_one_based() {
        for device in DeviceClass::ALL {
            assert_eq!(DeviceClass::from_raw(device.raw()), Some(device));
        }
        assert_eq!(DeviceClass::from_raw(0), None);
        assert_eq!(DeviceClass::from_raw(DeviceClass::RAW_MAX), None);
    }

    #[test]
    fn small_vlm_is_unavailable_on_first_generation() {
        let mut support = FeatureSupport::default();
        for device in DeviceClass::ALL {
            support.derive_for(device);
        }
        assert!(!support.is_supported(DeviceClass::Gaudi, Feature::SmallVlm));
        assert!(support.is_supported(DeviceClass::Greco, Feature::SmallVlm));
        assert!(support.is_supported(DeviceClass::Gaudi2, Feature::SmallVlm));
        assert!(support.is_supported(DeviceClass::Gaudi3, Feature::SmallVlm));
    }
}
