//! Device capability descriptions.

use modelpool_core::DeviceId;
use serde::{Deserialize, Serialize};

/// Capabilities of one accelerator, as reported at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub id: DeviceId,
    /// Total memory capacity in bytes.
    pub total_memory_bytes: u64,
    /// Whether the device shares an address space with the host; unified
    /// devices tolerate host-resident spillover better.
    pub unified_memory: bool,
    /// How many component transfers the device sustains concurrently.
    pub max_concurrent_transfers: usize,
}

impl DeviceCapabilities {
    pub fn new(id: DeviceId, total_memory_bytes: u64) -> Self {
        Self {
            id,
            total_memory_bytes,
            unified_memory: matches!(id.kind, modelpool_core::DeviceKind::Cpu),
            max_concurrent_transfers: 2,
        }
    }
}

/// A deterministic device set for tests and local development: one host
/// device and one discrete accelerator.
pub fn simulated_devices() -> Vec<DeviceCapabilities> {
    vec![
        DeviceCapabilities::new(DeviceId::cpu(), 64 * 1024 * 1024 * 1024),
        DeviceCapabilities::new(DeviceId::cuda(0), 16 * 1024 * 1024 * 1024),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_set_is_deterministic() {
        let a = simulated_devices();
        let b = simulated_devices();
        assert_eq!(a, b);
        assert!(a.iter().any(|d| d.id == DeviceId::cpu()));
        assert!(a.iter().any(|d| d.id == DeviceId::cuda(0)));
    }

    #[test]
    fn cpu_is_unified() {
        assert!(DeviceCapabilities::new(DeviceId::cpu(), 1024).unified_memory);
        assert!(!DeviceCapabilities::new(DeviceId::cuda(0), 1024).unified_memory);
    }
}
