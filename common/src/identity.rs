use std::fmt;

use serde::Serialize;

pub const DEVICE_ID_PREFIX: &str = "GT-";

/// Source of the hardware-unique integer the device id is derived from.
pub trait HardwareIdentity {
    fn hardware_id(&self) -> u64;
}

/// Stable device identifier, e.g. `GT-a1b2c3d4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn generate(source: &impl HardwareIdentity) -> Self {
        Self::from_hardware_id(source.hardware_id())
    }

    /// Only the low 32 bits take part, rendered as lowercase hex without padding.
    pub fn from_hardware_id(raw: u64) -> Self {
        Self(format!("{DEVICE_ID_PREFIX}{:x}", raw as u32))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for DeviceId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Fixed identity for targets without eFuse access.
#[derive(Debug, Clone, Copy)]
pub struct StaticIdentity(pub u64);

impl HardwareIdentity for StaticIdentity {
    fn hardware_id(&self) -> u64 {
        self.0
    }
}
