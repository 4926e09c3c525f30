//! Accelerator identity shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Accelerator family a component can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

/// Identity of one accelerator in the process.
///
/// Displayed as `cpu`, `cuda:0`, `metal:1`, matching how device strings
/// appear in logs and serialized reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub index: u32,
}

impl DeviceId {
    pub const fn cpu() -> Self {
        Self { kind: DeviceKind::Cpu, index: 0 }
    }

    pub const fn cuda(index: u32) -> Self {
        Self { kind: DeviceKind::Cuda, index }
    }

    pub const fn metal(index: u32) -> Self {
        Self { kind: DeviceKind::Metal, index }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda:{}", self.index),
            DeviceKind::Metal => write!(f, "metal:{}", self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(DeviceId::cpu().to_string(), "cpu");
        assert_eq!(DeviceId::cuda(0).to_string(), "cuda:0");
        assert_eq!(DeviceId::metal(1).to_string(), "metal:1");
    }

    #[test]
    fn device_ids_are_hashable_keys() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(DeviceId::cuda(0), 1u64);
        map.insert(DeviceId::cuda(1), 2u64);
        assert_eq!(map.get(&DeviceId::cuda(0)), Some(&1));
        assert_eq!(map.len(), 2);
    }
}
